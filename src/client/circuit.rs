//! The client half of a CA TCP virtual circuit.
//!
//! [`Circuit::connect`] performs the version and identity handshake, then
//! hands the socket to a background task that owns all circuit state. The
//! returned handle talks to that task over an mpsc request channel, so
//! reads, writes and subscriptions from any number of callers are
//! serialized onto the single wire without shared locks.

use std::{
    cmp::max,
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt, split},
    net::TcpStream,
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue, MonitorMask},
    messages::{self, Access, CAMessage, ClientMessage, ErrorCondition, Message},
    utils::{get_default_connection_timeout, wrapping_inplace_add},
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("Failed to parse message from server")]
    ServerSentInvalidMessage,
    #[error("The server version ({0}) was incompatible")]
    ServerVersionMismatch(u16),
    #[error("The circuit is closing or has closed")]
    CircuitClosed,
    #[error("The channel does not exist or is already closed")]
    ChannelClosed,
    #[error("Channel creation failed")]
    ChannelCreateFailed,
    #[error("The server rejected the write: {0}")]
    WriteRejected(ErrorCondition),
    #[error("The server returned an error: {0}")]
    ErrorResponse(ErrorCondition),
    #[error("Timed out waiting for the server")]
    Timeout,
}

enum CircuitRequest {
    GetChannel(String, oneshot::Sender<Result<ChannelInfo, ClientError>>),
    /// Read a single value from the server
    Read {
        channel: u32,
        length: usize,
        category: DbrCategory,
        reply: oneshot::Sender<Result<Dbr, ClientError>>,
    },
    /// Write a value to the server, completing when the server confirms it
    Write {
        channel: u32,
        value: DbrValue,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    /// Start a subscription to a PV on the server
    Subscribe {
        channel: u32,
        length: usize,
        dbr_type: DbrType,
        reply: oneshot::Sender<Result<broadcast::Receiver<Dbr>, ClientError>>,
    },
}

/// Handle to one connected circuit. Dropping it closes the connection.
pub struct Circuit {
    address: SocketAddr,
    cancel: CancellationToken,
    requests_tx: mpsc::Sender<CircuitRequest>,
}

impl Circuit {
    pub async fn connect(address: &SocketAddr, protocol_version: u16) -> Result<Self, ClientError> {
        debug!("Connecting new Circuit to {address}");
        let mut tcp = TcpStream::connect(address).await?;
        // Work out what to call ourselves
        let client_name = whoami::username();
        let host_name = whoami::fallible::hostname().unwrap_or_else(|_| client_name.clone());

        // Exchange version messages
        Message::write_all_messages(
            &[messages::Version {
                protocol_version,
                ..Default::default()
            }
            .into()],
            &mut tcp,
        )
        .await?;
        Self::do_read_check_version(&mut tcp).await?;
        debug!("Done version exchange, sending identification messages");
        // Send the identification messages
        Message::write_all_messages(
            &[
                messages::ClientName { name: client_name }.into(),
                messages::HostName { name: host_name }.into(),
            ],
            &mut tcp,
        )
        .await?;

        let (requests_tx, requests_rx) = mpsc::channel(8);
        // Now we have a connected circuit, ready for lifecycle!
        let cancel = CancellationToken::new();

        // Make the internal object
        let inner_cancel = cancel.clone();
        let inner_address = *address;
        tokio::spawn(async move {
            CircuitInternal {
                address: inner_address,
                requests_rx,
                cancel: inner_cancel,
                next_cid: 0,
                channel_lookup: Default::default(),
                channels: Default::default(),
                pending_reads: Default::default(),
                pending_writes: Default::default(),
                last_echo_sent_at: Instant::now(),
                last_received_message_at: Instant::now(),
                pending_broadcasts: Default::default(),
                broadcast_receivers: Default::default(),
                broadcast_channels: Default::default(),
            }
            .circuit_lifecycle(tcp)
            .await;
        });

        debug!("Circuit Ready.");

        Ok(Circuit {
            address: *address,
            cancel,
            requests_tx,
        })
    }

    /// The server this circuit is connected to
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Close the circuit and its background task
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Handle reading the Version packet from the stream, and checking we can handle it
    async fn do_read_check_version(socket: &mut TcpStream) -> Result<(), ClientError> {
        let mut ver_buf = [0u8; 16];
        socket.read_exact(&mut ver_buf).await?;
        let (_, server_version) = messages::Version::parse(&ver_buf)
            .map_err(|_| ClientError::ServerSentInvalidMessage)?;
        if !server_version.is_compatible() {
            Err(ClientError::ServerVersionMismatch(
                server_version.protocol_version,
            ))
        } else {
            Ok(())
        }
    }

    /// Open (or fetch the already open) channel for a PV name
    pub async fn get_channel(&self, name: &str) -> Result<ChannelInfo, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(CircuitRequest::GetChannel(name.to_owned(), tx))
            .await
            .map_err(|_| ClientError::CircuitClosed)?;
        rx.await.map_err(|_| ClientError::CircuitClosed)?
    }

    /// Read a PV value, with the requested category of metadata attached
    pub async fn read_pv(&self, name: &str, category: DbrCategory) -> Result<Dbr, ClientError> {
        let channel = self.get_channel(name).await?;
        debug!("Circuit read_pv got channel: {channel:?}");
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(CircuitRequest::Read {
                channel: channel.cid,
                length: 0usize,
                category,
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::CircuitClosed)?;
        rx.await.map_err(|_| ClientError::CircuitClosed)?
    }

    /// Write a value, waiting up to `timeout` for the server to confirm it
    pub async fn write_pv(
        &self,
        name: &str,
        value: DbrValue,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let channel = self.get_channel(name).await?;
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(CircuitRequest::Write {
                channel: channel.cid,
                value,
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::CircuitClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(reply) => reply.map_err(|_| ClientError::CircuitClosed)?,
        }
    }

    /// Subscribe to a PV, served at the channel's native type with the
    /// requested category of metadata attached
    pub async fn subscribe(
        &self,
        name: &str,
        category: DbrCategory,
    ) -> Result<broadcast::Receiver<Dbr>, ClientError> {
        let channel = self.get_channel(name).await?;
        debug!("Circuit subscribe got channel: {channel:?}");
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(CircuitRequest::Subscribe {
                channel: channel.cid,
                length: 0,
                dbr_type: DbrType {
                    basic_type: channel.native_type,
                    category,
                },
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::CircuitClosed)?;
        rx.await.map_err(|_| ClientError::CircuitClosed)?
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default, Copy, Clone)]
enum ChannelState {
    #[default]
    Closed,
    SentCreate,
    Ready,
}

/// Summary of an open channel, as reported by the server
#[derive(Debug, Clone, Copy)]
pub struct ChannelInfo {
    pub native_type: DbrBasicType,
    pub native_count: u32,
    pub cid: u32,
    pub permissions: Access,
}

#[derive(Debug, Default)]
struct Channel {
    name: String,
    state: ChannelState,
    native_type: Option<DbrBasicType>,
    native_count: u32,
    cid: u32,
    sid: u32,
    permissions: Access,
    /// Watchers waiting for this channel to be open
    pending_open: Vec<oneshot::Sender<Result<ChannelInfo, ClientError>>>,
    next_ioid: u32,
    broadcast_receivers: Vec<u32>,
}

impl Channel {
    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            native_type: self.native_type.unwrap(),
            native_count: self.native_count,
            cid: self.cid,
            permissions: self.permissions,
        }
    }
}

// Inner circuit state, used to hold async management data
struct CircuitInternal {
    /// A copy of the address we are connected to
    address: SocketAddr,
    /// When the last message was received. Used to calculate Echo timing.
    last_received_message_at: Instant,
    last_echo_sent_at: Instant,
    requests_rx: mpsc::Receiver<CircuitRequest>,
    cancel: CancellationToken,
    next_cid: u32,
    channels: HashMap<u32, Channel>,
    channel_lookup: HashMap<String, u32>,
    /// Watchers waiting for specific reads
    pending_reads: HashMap<u32, (Instant, oneshot::Sender<Result<Dbr, ClientError>>)>,
    /// Watchers waiting for write confirmations
    pending_writes: HashMap<u32, (Instant, oneshot::Sender<Result<(), ClientError>>)>,
    /// Broadcast subscriptions we have not had confirmed yet
    #[allow(clippy::type_complexity)]
    pending_broadcasts: HashMap<
        u32,
        (
            Instant,
            (
                usize,
                DbrType,
                oneshot::Sender<Result<broadcast::Receiver<Dbr>, ClientError>>,
            ),
        ),
    >,
    broadcast_receivers: HashMap<u32, (usize, DbrType, broadcast::Sender<Dbr>)>,
    broadcast_channels: HashMap<u32, u32>,
}

impl CircuitInternal {
    async fn circuit_lifecycle(&mut self, tcp: TcpStream) {
        debug!("Started circuit to {}", self.address);
        let (tcp_rx, mut tcp_tx) = split(tcp);
        let mut framed = FramedRead::with_capacity(tcp_rx, ClientMessage::default(), 16384usize);
        let activity_period = Duration::from_secs_f32(get_default_connection_timeout() / 2.0);
        loop {
            let next_timing_stop =
                max(self.last_echo_sent_at, self.last_received_message_at) + activity_period;
            let messages_out = select! {
                _ = self.cancel.cancelled() => break,
                incoming = framed.next() => match incoming {
                    Some(message) => match message {
                        Ok(message) => Some(self.handle_message(message)),
                        Err(e) => {
                            error!("Got error processing server message: {e}");
                            continue;
                        }
                    },
                    None => break,
                },
                request = self.requests_rx.recv() => match request {
                    None => break,
                    Some(req) => Some(self.handle_request(req))
                },
                _ = tokio::time::sleep_until(next_timing_stop.into()) => {
                    if self.last_echo_sent_at < self.last_received_message_at {
                        self.last_echo_sent_at = Instant::now();
                        Some(vec![Message::Echo])
                    } else {
                        // We sent an echo already, this is the termination time
                        error!("Received no reply from server, assuming connection dead");
                        break
                    }
                },
            };

            // Send any messages out
            if let Some(messages) = messages_out {
                for message in &messages {
                    trace!("Sending {message:?}");
                }
                if Message::write_all_messages(&messages, &mut tcp_tx)
                    .await
                    .is_err()
                {
                    error!("Failed to write messages to io stream, aborting");
                    break;
                }
            }
        }
        self.cancel.cancel();
        let _ = tcp_tx.shutdown().await;
        // Pending maps and broadcast senders drop here, which tells every
        // outstanding caller and subscriber that the circuit is gone
    }

    fn create_channel(&mut self, name: String) -> (&mut Channel, Vec<Message>) {
        // We need to open a new channel
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        let channel = Channel {
            cid,
            state: ChannelState::SentCreate, // Or, about to, anyway
            next_ioid: 4242,
            name: name.clone(),
            ..Default::default()
        };
        let _span = debug_span!("create_channel", cid = cid).entered();
        debug!("Creating channel '{name}' cid: {cid}");
        self.channel_lookup.insert(name.clone(), cid);
        self.channels.insert(cid, channel);
        (
            self.channels.get_mut(&cid).unwrap(),
            vec![
                messages::CreateChannel {
                    client_id: cid,
                    channel_name: name,
                    ..Default::default()
                }
                .into(),
            ],
        )
    }

    fn handle_request(&mut self, request: CircuitRequest) -> Vec<Message> {
        match request {
            CircuitRequest::GetChannel(name, sender) => {
                if let Some(id) = self.channel_lookup.get(&name) {
                    // We already have this channel.. let's check if it is open
                    let channel = self.channels.get_mut(id).unwrap();
                    match channel.state {
                        ChannelState::Closed => panic!("We should never see a closed channel?"),
                        ChannelState::SentCreate => channel.pending_open.push(sender),
                        ChannelState::Ready => {
                            // Already ready, just send it out
                            let _ = sender.send(Ok(channel.info()));
                        }
                    }
                    Vec::new()
                } else {
                    let (channel, messages) = self.create_channel(name);
                    channel.pending_open.push(sender);
                    // Pass the channel create messages back
                    messages
                }
            }
            CircuitRequest::Read {
                channel: cid,
                length,
                category,
                reply,
            } => {
                let Some(channel) = self.channels.get_mut(&cid) else {
                    let _ = reply.send(Err(ClientError::ChannelClosed));
                    return Vec::new();
                };
                let _span = debug_span!("handle_request", cid = cid).entered();
                // Send the read request
                let ioid = wrapping_inplace_add(&mut channel.next_ioid);
                debug!(
                    "Sending read request {ioid} for channel {cid} ({})",
                    channel.name
                );
                self.pending_reads.insert(ioid, (Instant::now(), reply));
                vec![
                    messages::ReadNotify {
                        data_type: DbrType {
                            basic_type: channel.native_type.unwrap(),
                            category,
                        },
                        data_count: length as u32,
                        server_id: channel.sid,
                        client_ioid: ioid,
                    }
                    .into(),
                ]
            }
            CircuitRequest::Write {
                channel: cid,
                value,
                reply,
            } => {
                let Some(channel) = self.channels.get_mut(&cid) else {
                    let _ = reply.send(Err(ClientError::ChannelClosed));
                    return Vec::new();
                };
                let _span = debug_span!("handle_request", cid = cid).entered();
                let ioid = wrapping_inplace_add(&mut channel.next_ioid);
                debug!(
                    "Sending write request {ioid} for channel {cid} ({}): {value:?}",
                    channel.name
                );
                let (count, data) = value.to_bytes(None);
                self.pending_writes.insert(ioid, (Instant::now(), reply));
                vec![
                    messages::WriteNotify {
                        data_type: DbrType {
                            basic_type: value.get_type(),
                            category: DbrCategory::Basic,
                        },
                        data_count: count as u32,
                        server_id: channel.sid,
                        client_ioid: ioid,
                        data,
                    }
                    .into(),
                ]
            }
            CircuitRequest::Subscribe {
                channel: cid,
                length,
                dbr_type,
                reply,
            } => {
                let Some(channel) = self.channels.get_mut(&cid) else {
                    let _ = reply.send(Err(ClientError::ChannelClosed));
                    return Vec::new();
                };
                let _span = debug_span!("handle_request", cid = cid).entered();
                let ioid = wrapping_inplace_add(&mut channel.next_ioid);
                self.pending_broadcasts
                    .insert(ioid, (Instant::now(), (length, dbr_type, reply)));
                self.broadcast_channels.insert(ioid, channel.cid);
                channel.broadcast_receivers.push(ioid);
                vec![
                    messages::EventAdd {
                        data_type: dbr_type,
                        data_count: length as u32,
                        server_id: channel.sid,
                        subscription_id: ioid,
                        mask: MonitorMask::default(),
                    }
                    .into(),
                ]
            }
        }
    }

    fn handle_message(&mut self, message: ClientMessage) -> Vec<Message> {
        self.last_received_message_at = Instant::now();
        trace!("Received message: {message:?}");
        match message {
            ClientMessage::AccessRights(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let Some(channel) = self.channels.get_mut(&msg.client_id) else {
                    debug!("Got message for closed/uncreated channel");
                    return Vec::new();
                };
                debug!("Got AccessRights update: {}", msg.access_rights);
                channel.permissions = msg.access_rights;
                Vec::new()
            }
            ClientMessage::CreateChannelResponse(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let Some(channel) = self.channels.get_mut(&msg.client_id) else {
                    debug!("Got message for closed/uncreated channel: {msg:?}");
                    return Vec::new();
                };
                channel.native_count = msg.data_count;
                channel.native_type = Some(msg.data_type.basic_type);
                channel.state = ChannelState::Ready;
                channel.sid = msg.server_id;
                let info = channel.info();

                for sender in channel.pending_open.drain(..) {
                    let _ = sender.send(Ok(info));
                }
                Vec::new()
            }
            ClientMessage::CreateChannelFailure(msg) => {
                let Some(mut channel) = self.channels.remove(&msg.client_id) else {
                    warn!(
                        "Got channel failure message for a nonexistent channel {}",
                        msg.client_id
                    );
                    return Vec::new();
                };
                self.channel_lookup.remove(&channel.name);
                for sender in channel.pending_open.drain(..) {
                    let _ = sender.send(Err(ClientError::ChannelCreateFailed));
                }
                Vec::new()
            }
            ClientMessage::ReadNotifyResponse(msg) => {
                let Some((_, reply_tx)) = self.pending_reads.remove(&msg.client_ioid) else {
                    warn!("Got ReadNotifyResponse for apparently unknown read request?! {msg:?}");
                    return Vec::new();
                };
                debug!("Processing message {msg:?}");
                let reply = match msg.condition() {
                    ErrorCondition::Normal => {
                        Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                            .map_err(|_| ClientError::ServerSentInvalidMessage)
                    }
                    condition => Err(ClientError::ErrorResponse(condition)),
                };
                let _ = reply_tx.send(reply);
                Vec::new()
            }
            ClientMessage::WriteNotifyResponse(msg) => {
                let Some((_, reply_tx)) = self.pending_writes.remove(&msg.client_ioid) else {
                    warn!("Got WriteNotifyResponse for apparently unknown write request?! {msg:?}");
                    return Vec::new();
                };
                let _ = match msg.condition() {
                    ErrorCondition::Normal => reply_tx.send(Ok(())),
                    condition => reply_tx.send(Err(ClientError::WriteRejected(condition))),
                };
                Vec::new()
            }
            ClientMessage::Echo => Vec::new(), // Echo just bumps our last_received message counter
            ClientMessage::Version(_msg) => {
                warn!("Got unexpected VERSION message in normal circuit lifecycle.");
                Vec::new()
            }
            ClientMessage::EventAddResponse(msg) => {
                let Some(channel_id) = self.broadcast_channels.get(&msg.subscription_id) else {
                    warn!(
                        "Got subscription message without associated channel: {}",
                        msg.subscription_id
                    );
                    return Vec::new();
                };
                let _span = debug_span!("handle_message", cid = channel_id).entered();
                if msg.data.is_empty() {
                    debug!(
                        "Got empty EventAddResponse: Purging subscription {}",
                        msg.subscription_id
                    );
                    // This is a special case: The server is requesting termination
                    // of the subscription (possibly because we asked it to). Shut down
                    // the channel monitors.
                    if let Some(cid) = self.broadcast_channels.get(&msg.subscription_id) {
                        self.channels
                            .get_mut(cid)
                            .unwrap()
                            .broadcast_receivers
                            .retain(|s| *s != msg.subscription_id);
                    }
                    self.broadcast_channels.remove(&msg.subscription_id);
                    self.broadcast_receivers.remove(&msg.subscription_id);
                    self.pending_broadcasts.remove(&msg.subscription_id);
                    return Vec::new();
                }
                let Ok(dbr) = Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                else {
                    error!("Got invalid subscription response from server: {msg:?}");
                    return Vec::new();
                };
                debug!(
                    "Got subscription {} response: {:?}",
                    msg.subscription_id, dbr
                );
                // Check - this might be the first
                if let Some((_, (length, dbrtype, reply))) =
                    self.pending_broadcasts.remove(&msg.subscription_id)
                {
                    // This is the first EventAdd response, tell waiting clients that opening was successful
                    let (tx, rx) = broadcast::channel(32);
                    self.broadcast_receivers
                        .insert(msg.subscription_id, (length, dbrtype, tx));
                    // Send the receiver to the waiting client
                    let _ = reply.send(Ok(rx));
                }
                let transmitter = &self
                    .broadcast_receivers
                    .get(&msg.subscription_id)
                    .expect("Should have just created this")
                    .2;
                match transmitter.send(dbr) {
                    Ok(0) | Err(_) => {
                        // We have no receivers left; cancel this subscription
                        debug!("No more receivers for {}: Cancelling", msg.subscription_id);

                        let sid = self.channels.get(channel_id).unwrap().sid;
                        return vec![msg.cancel(sid).into()];
                    }
                    Ok(_) => (),
                };
                Vec::new()
            }
            ClientMessage::ECAError(msg) => {
                // Complete the matching pending request if the failed
                // header survived intact
                match msg.request_context() {
                    Some((19, ioid)) => {
                        if let Some((_, reply)) = self.pending_writes.remove(&ioid) {
                            let _ = reply.send(Err(ClientError::WriteRejected(msg.condition)));
                            return Vec::new();
                        }
                    }
                    Some((15, ioid)) => {
                        if let Some((_, reply)) = self.pending_reads.remove(&ioid) {
                            let _ = reply.send(Err(ClientError::ErrorResponse(msg.condition)));
                            return Vec::new();
                        }
                    }
                    _ => (),
                }
                warn!(
                    "Server error on channel {}: {} ({})",
                    msg.client_id, msg.condition, msg.error_message
                );
                Vec::new()
            }
            ClientMessage::ServerDisconnect(msg) => {
                let Some(mut channel) = self.channels.remove(&msg.client_id) else {
                    warn!("Got disconnect for a nonexistent channel {}", msg.client_id);
                    return Vec::new();
                };
                warn!(
                    "Server disconnected channel {} ({})",
                    msg.client_id, channel.name
                );
                self.channel_lookup.remove(&channel.name);
                for sender in channel.pending_open.drain(..) {
                    let _ = sender.send(Err(ClientError::ChannelClosed));
                }
                // Dropping the transmitters closes any subscription receivers
                for subscription in channel.broadcast_receivers.drain(..) {
                    self.broadcast_channels.remove(&subscription);
                    self.broadcast_receivers.remove(&subscription);
                    self.pending_broadcasts.remove(&subscription);
                }
                Vec::new()
            }
            msg => {
                debug!("Got unhandled message from server: {msg:?}");
                Vec::new()
            }
        }
    }
}
