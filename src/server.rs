//! The serving side of CA: circuits, searches and beacons.
//!
//! [`ServerBuilder`] binds the TCP listener and the UDP search socket,
//! hands the shutdown token to the [`Provider`], and spawns the long
//! running tasks. Each accepted circuit then runs as its own actor,
//! decoding requests through the [`ServerMessage`] codec and answering
//! with batched message writes.

use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::{broadcast, mpsc},
    task::{JoinError, JoinHandle},
    time::{Instant, sleep, sleep_until},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, error, info, trace, warn};

use crate::{
    dbr::{Dbr, DbrCategory, DbrType},
    messages::{
        self, AsBytes, CAMessage, CreateChannelFailure, CreateChannelResponse, EPICS_VERSION,
        ErrorCondition, EventAddResponse, EventCancelResponse, Message, MessageError,
        ReadNotifyResponse, RsrvIsUp, ServerMessage, WriteNotifyResponse, parse_search_packet,
    },
    providers::Provider,
    utils::{
        get_default_beacon_period, get_default_beacon_port, get_default_connection_timeout,
        get_default_server_port, get_target_broadcast_ips, new_reusable_udp_socket,
        wrapping_inplace_add,
    },
};

/// Subscriber ids handed to providers must be unique across every circuit
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Configures and starts a CA server around a [`Provider`].
///
/// ```no_run
/// # async fn example() -> std::io::Result<()> {
/// # use camirror::providers::LocalProvider;
/// # use camirror::ServerBuilder;
/// let provider = LocalProvider::default();
/// let server = ServerBuilder::new(provider).start().await?;
/// println!("Serving on TCP port {}", server.connection_port());
/// server.join().await.unwrap();
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder<T: Provider> {
    provider: T,
    connection_port: u16,
    search_port: u16,
    beacon_port: u16,
    beacons: bool,
}

impl<T: Provider> ServerBuilder<T> {
    pub fn new(provider: T) -> Self {
        ServerBuilder {
            provider,
            connection_port: get_default_server_port(),
            search_port: get_default_server_port(),
            beacon_port: get_default_beacon_port(),
            beacons: true,
        }
    }

    /// The TCP port circuits connect to. Use 0 to pick a free port.
    pub fn connection_port(mut self, port: u16) -> Self {
        self.connection_port = port;
        self
    }

    /// The UDP port listened to for name searches. Use 0 to pick a free
    /// port, which makes the server invisible to broadcast searches.
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }

    /// The UDP port beacons are broadcast to.
    pub fn beacon_port(mut self, port: u16) -> Self {
        self.beacon_port = port;
        self
    }

    /// Turn beacon broadcasting off (or back on). Useful for tests, where
    /// announcing the server to the whole subnet is unwanted.
    pub fn beacons(mut self, enabled: bool) -> Self {
        self.beacons = enabled;
        self
    }

    /// Bind the sockets and spawn the serving tasks.
    pub async fn start(mut self) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(("0.0.0.0", self.connection_port)).await?;
        let connection_port = listener.local_addr()?.port();
        let search_socket = new_reusable_udp_socket(("0.0.0.0", self.search_port))?;
        let search_port = search_socket.local_addr()?.port();
        info!("Listening for circuits on TCP {connection_port}, searches on UDP {search_port}");

        let cancel = CancellationToken::new();
        // The provider only learns about shutdown, never triggers it
        self.provider.attach(cancel.child_token());

        let mut tasks = vec![tokio::spawn(listen_for_searches(
            search_socket,
            self.provider.clone(),
            connection_port,
            cancel.clone(),
        ))];
        if self.beacons {
            tasks.push(tokio::spawn(broadcast_beacons(
                connection_port,
                self.beacon_port,
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(accept_circuits(
            listener,
            self.provider,
            connection_port,
            cancel.clone(),
        )));

        Ok(ServerHandle {
            connection_port,
            search_port,
            cancel,
            tasks,
        })
    }
}

/// A running server. Dropping the handle leaves the server running;
/// call [`ServerHandle::stop`] to shut it down.
pub struct ServerHandle {
    connection_port: u16,
    search_port: u16,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The TCP port the server accepts circuits on
    pub fn connection_port(&self) -> u16 {
        self.connection_port
    }

    /// The UDP port the server answers searches on
    pub fn search_port(&self) -> u16 {
        self.search_port
    }

    /// Stop the server and wait for all of its tasks to finish
    pub async fn stop(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the server tasks without asking them to stop
    pub async fn join(self) -> Result<(), JoinError> {
        for task in self.tasks {
            task.await?;
        }
        Ok(())
    }
}

async fn accept_circuits<T: Provider>(
    listener: TcpListener,
    provider: T,
    connection_port: u16,
    cancel: CancellationToken,
) {
    let mut next_circuit_id = 0u64;
    loop {
        select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let id = wrapping_inplace_add(&mut next_circuit_id);
                    debug!("Accepted circuit {id} from {peer}");
                    tokio::spawn(serve_circuit(
                        id,
                        stream,
                        peer,
                        provider.clone(),
                        connection_port,
                        cancel.child_token(),
                    ));
                }
                Err(e) => warn!("Failed to accept circuit: {e}"),
            },
        }
    }
}

/// Answer UDP name searches for PVs our provider owns.
///
/// A reply datagram is only sent when at least one name matched: CA
/// clients treat silence as "not here" and retry elsewhere.
async fn listen_for_searches<T: Provider>(
    socket: UdpSocket,
    provider: T,
    connection_port: u16,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; 16384];
    loop {
        select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => {
                let (size, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Search socket read failed: {e}");
                        continue;
                    }
                };
                let Ok(searches) = parse_search_packet(&buffer[..size]) else {
                    trace!("Ignoring malformed search packet from {src}");
                    continue;
                };
                let matches: Vec<_> = searches
                    .iter()
                    .filter(|search| provider.provides(&search.channel_name))
                    .collect();
                if matches.is_empty() {
                    continue;
                }
                let mut reply = Vec::new();
                let build = messages::Version::default()
                    .write(&mut reply)
                    .and_then(|()| {
                        for search in &matches {
                            debug!("Answering search for {} from {src}", search.channel_name);
                            search.respond(None, connection_port, true).write(&mut reply)?;
                        }
                        Ok(())
                    });
                match build {
                    Ok(()) => {
                        if let Err(e) = socket.send_to(&reply, src).await {
                            warn!("Failed to send search response to {src}: {e}");
                        }
                    }
                    Err(e) => error!("Failed to build search response: {e}"),
                }
            }
        }
    }
}

/// Periodically announce our presence to the broadcast addresses of every
/// interface, so clients know to flush their negative search caches.
async fn broadcast_beacons(connection_port: u16, beacon_port: u16, cancel: CancellationToken) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Could not open beacon socket: {e}");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        error!("Could not make beacon socket broadcast: {e}");
        return;
    }
    let period = Duration::from_secs_f32(get_default_beacon_period());
    let mut beacon = RsrvIsUp {
        server_port: connection_port,
        beacon_id: 0,
        server_ip: None,
        protocol_version: EPICS_VERSION,
    };
    loop {
        let message = beacon.as_bytes();
        for target in get_target_broadcast_ips(beacon_port) {
            if let Err(e) = socket.send_to(&message, target).await {
                debug!("Failed to send beacon to {target}: {e}");
            }
        }
        trace!("Sent beacon {}", beacon.beacon_id);
        beacon.beacon_id = beacon.beacon_id.wrapping_add(1);
        select! {
            _ = cancel.cancelled() => break,
            _ = sleep(period) => (),
        }
    }
}

async fn serve_circuit<T: Provider>(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    provider: T,
    connection_port: u16,
    cancel: CancellationToken,
) {
    let mut circuit = Circuit::new(id, provider, connection_port, cancel);
    match circuit.run(stream).await {
        Ok(()) => debug!("Circuit {id} to {peer} closed"),
        Err(e) => debug!("Circuit {id} to {peer} ended: {e}"),
    }
    circuit.release_monitors();
}

#[derive(Debug, Error)]
enum CircuitError {
    #[error("IO error on circuit: {0}")]
    IO(#[from] io::Error),
    #[error("client sent an invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
}

/// A channel the client has opened onto one of our PVs
struct ServedChannel {
    pv_name: String,
}

/// One active subscription, keyed externally by (server id, subscription id)
struct ServedMonitor {
    pv_name: String,
    subscriber_id: u64,
    data_type: DbrType,
    data_count: usize,
    receiver: broadcast::Receiver<Dbr>,
}

/// Server-side state for a single client TCP connection
struct Circuit<T: Provider> {
    id: u64,
    provider: T,
    connection_port: u16,
    cancel: CancellationToken,
    client_version: Option<u16>,
    client_user_name: Option<String>,
    client_host_name: Option<String>,
    channels: HashMap<u32, ServedChannel>,
    next_server_id: u32,
    monitors: HashMap<(u32, u32), ServedMonitor>,
    events_on: bool,
    /// Held so the trigger channel can never close while we run
    trigger_tx: mpsc::Sender<String>,
    trigger_rx: mpsc::Receiver<String>,
    last_received_at: Instant,
}

impl<T: Provider> Circuit<T> {
    fn new(id: u64, provider: T, connection_port: u16, cancel: CancellationToken) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(32);
        Circuit {
            id,
            provider,
            connection_port,
            cancel,
            client_version: None,
            client_user_name: None,
            client_host_name: None,
            channels: HashMap::new(),
            next_server_id: 0,
            monitors: HashMap::new(),
            events_on: true,
            trigger_tx,
            trigger_rx,
            last_received_at: Instant::now(),
        }
    }

    async fn run(&mut self, stream: TcpStream) -> Result<(), CircuitError> {
        let (rx, mut tx) = stream.into_split();
        let mut framed = FramedRead::with_capacity(rx, ServerMessage::default(), 16384);
        // Clients echo at half their connection timeout, so double ours
        // of silence means the far side is gone
        let idle_limit = Duration::from_secs_f32(get_default_connection_timeout() * 2.0);
        loop {
            let mut replies = Vec::new();
            select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(self.last_received_at + idle_limit) => {
                    debug!("Closing circuit {} after {idle_limit:?} of silence", self.id);
                    break;
                }
                message = framed.next() => {
                    let Some(message) = message else {
                        trace!("Client on circuit {} closed the connection", self.id);
                        break;
                    };
                    self.last_received_at = Instant::now();
                    self.handle_message(message?, &mut replies).await;
                }
                pv_name = self.trigger_rx.recv() => {
                    if let Some(pv_name) = pv_name
                        && self.events_on
                    {
                        self.pump_monitors(&pv_name, &mut replies);
                    }
                }
            }
            if !replies.is_empty() {
                Message::write_all_messages(&replies, &mut tx).await?;
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: ServerMessage, replies: &mut Vec<Message>) {
        match message {
            ServerMessage::Version(version) => {
                if self.client_version.is_none() {
                    if !version.is_compatible() {
                        warn!(
                            "Client on circuit {} speaks protocol {}, older than we support",
                            self.id, version.protocol_version
                        );
                    }
                    self.client_version = Some(version.protocol_version);
                    replies.push(messages::Version::default().into());
                }
            }
            ServerMessage::ClientName(name) => {
                trace!("Circuit {} client user is {}", self.id, name.name);
                self.client_user_name = Some(name.name);
            }
            ServerMessage::HostName(name) => {
                trace!("Circuit {} client host is {}", self.id, name.name);
                self.client_host_name = Some(name.name);
            }
            ServerMessage::Search(search) => {
                if self.provider.provides(&search.channel_name) {
                    replies.push(search.respond(None, self.connection_port, false).into());
                }
            }
            ServerMessage::CreateChannel(request) => self.do_create_channel(request, replies),
            ServerMessage::ReadNotify(request) => replies.push(self.do_read(&request).into()),
            ServerMessage::WriteNotify(request) => {
                replies.push(self.do_write(&request).await.into());
            }
            ServerMessage::EventAdd(request) => self.do_event_add(&request, replies),
            ServerMessage::EventCancel(request) => {
                let key = (request.server_id, request.subscription_id);
                if let Some(monitor) = self.monitors.remove(&key) {
                    debug!(
                        "Circuit {} cancelled subscription {} on {}",
                        self.id, request.subscription_id, monitor.pv_name
                    );
                    self.provider.cancel_monitor_value(
                        &monitor.pv_name,
                        monitor.subscriber_id,
                        monitor.data_type,
                        monitor.data_count,
                    );
                    replies.push(
                        EventCancelResponse {
                            data_type: request.data_type,
                            server_id: request.server_id,
                            subscription_id: request.subscription_id,
                        }
                        .into(),
                    );
                }
            }
            ServerMessage::EventsOff => {
                trace!("Circuit {} suspended subscription updates", self.id);
                self.events_on = false;
            }
            ServerMessage::EventsOn => {
                trace!("Circuit {} resumed subscription updates", self.id);
                self.events_on = true;
                // Flush anything that arrived while events were off
                let names: HashSet<String> = self
                    .monitors
                    .values()
                    .map(|monitor| monitor.pv_name.clone())
                    .collect();
                for name in names {
                    self.pump_monitors(&name, replies);
                }
            }
            ServerMessage::ClearChannel(request) => {
                let stale: Vec<(u32, u32)> = self
                    .monitors
                    .keys()
                    .filter(|(server_id, _)| *server_id == request.server_id)
                    .copied()
                    .collect();
                for key in stale {
                    if let Some(monitor) = self.monitors.remove(&key) {
                        self.provider.cancel_monitor_value(
                            &monitor.pv_name,
                            monitor.subscriber_id,
                            monitor.data_type,
                            monitor.data_count,
                        );
                    }
                }
                if let Some(channel) = self.channels.remove(&request.server_id) {
                    debug!("Circuit {} cleared channel to {}", self.id, channel.pv_name);
                }
                replies.push(request.into());
            }
            ServerMessage::Echo => replies.push(Message::Echo),
        }
    }

    fn do_create_channel(&mut self, request: messages::CreateChannel, replies: &mut Vec<Message>) {
        if !self.provider.provides(&request.channel_name) {
            debug!(
                "Circuit {} asked for {}, which we do not serve",
                self.id, request.channel_name
            );
            replies.push(
                CreateChannelFailure {
                    client_id: request.client_id,
                }
                .into(),
            );
            return;
        }
        // An untyped read gives us the native type and count to declare
        match self.provider.read_value(&request.channel_name, None) {
            Ok(dbr) => {
                let access = self.provider.get_access_right(
                    &request.channel_name,
                    self.client_user_name.as_deref(),
                    self.client_host_name.as_deref(),
                );
                let server_id = wrapping_inplace_add(&mut self.next_server_id);
                debug!(
                    "Circuit {} opened {} as channel {server_id} ({access})",
                    self.id, request.channel_name
                );
                self.channels.insert(
                    server_id,
                    ServedChannel {
                        pv_name: request.channel_name,
                    },
                );
                replies.push(
                    messages::AccessRights {
                        client_id: request.client_id,
                        access_rights: access,
                    }
                    .into(),
                );
                replies.push(
                    CreateChannelResponse {
                        data_type: DbrType {
                            basic_type: dbr.value().get_type(),
                            category: DbrCategory::Basic,
                        },
                        data_count: dbr.value().get_count() as u32,
                        client_id: request.client_id,
                        server_id,
                    }
                    .into(),
                );
            }
            Err(condition) => {
                warn!(
                    "Reading {} to open a channel failed: {condition}",
                    request.channel_name
                );
                replies.push(
                    CreateChannelFailure {
                        client_id: request.client_id,
                    }
                    .into(),
                );
            }
        }
    }

    fn do_read(&self, request: &messages::ReadNotify) -> ReadNotifyResponse {
        let failure = |condition: ErrorCondition| ReadNotifyResponse {
            data_type: request.data_type,
            data_count: 0,
            status: condition.eca_code(),
            client_ioid: request.client_ioid,
            data: Vec::new(),
        };
        let Some(channel) = self.channels.get(&request.server_id) else {
            return failure(ErrorCondition::BadChId);
        };
        match self
            .provider
            .read_value(&channel.pv_name, Some(request.data_type))
            .and_then(|dbr| dbr.convert_to(request.data_type))
        {
            Ok(dbr) => {
                // A count of zero asks for however many elements we hold
                let (count, data) = dbr.to_bytes(NonZeroUsize::new(request.data_count as usize));
                ReadNotifyResponse {
                    data_type: request.data_type,
                    data_count: count as u32,
                    status: ErrorCondition::Normal.eca_code(),
                    client_ioid: request.client_ioid,
                    data,
                }
            }
            Err(condition) => {
                debug!(
                    "Read of {} as {:?} failed: {condition}",
                    channel.pv_name, request.data_type
                );
                failure(condition)
            }
        }
    }

    async fn do_write(&mut self, request: &messages::WriteNotify) -> WriteNotifyResponse {
        let respond = |condition: ErrorCondition| WriteNotifyResponse {
            data_type: request.data_type,
            data_count: request.data_count,
            status: condition.eca_code(),
            client_ioid: request.client_ioid,
        };
        let Some(channel) = self.channels.get(&request.server_id) else {
            return respond(ErrorCondition::BadChId);
        };
        let pv_name = channel.pv_name.clone();
        let access = self.provider.get_access_right(
            &pv_name,
            self.client_user_name.as_deref(),
            self.client_host_name.as_deref(),
        );
        if !access.can_write() {
            debug!("Circuit {} may not write to {pv_name}", self.id);
            return respond(ErrorCondition::NoWtAccess);
        }
        let decoded =
            Dbr::from_bytes(request.data_type, request.data_count as usize, &request.data);
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                debug!("Could not decode write payload for {pv_name}: {e}");
                return respond(ErrorCondition::BadType);
            }
        };
        match self.provider.write_value(&pv_name, value).await {
            Ok(disposition) => {
                trace!("Write to {pv_name} completed as {disposition:?}");
                respond(ErrorCondition::Normal)
            }
            Err(condition) => {
                debug!("Write to {pv_name} rejected: {condition}");
                respond(condition)
            }
        }
    }

    fn do_event_add(&mut self, request: &messages::EventAdd, replies: &mut Vec<Message>) {
        let failure = |condition: ErrorCondition| EventAddResponse {
            data_type: request.data_type,
            data_count: 0,
            status: condition.eca_code(),
            subscription_id: request.subscription_id,
            data: Vec::new(),
        };
        let Some(channel) = self.channels.get(&request.server_id) else {
            replies.push(failure(ErrorCondition::BadChId).into());
            return;
        };
        let pv_name = channel.pv_name.clone();
        let subscriber_id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        match self.provider.monitor_value(
            &pv_name,
            subscriber_id,
            request.data_type,
            request.data_count as usize,
            request.mask,
            self.trigger_tx.clone(),
        ) {
            Ok(receiver) => {
                debug!(
                    "Circuit {} subscribed to {pv_name} as subscription {}",
                    self.id, request.subscription_id
                );
                self.monitors.insert(
                    (request.server_id, request.subscription_id),
                    ServedMonitor {
                        pv_name: pv_name.clone(),
                        subscriber_id,
                        data_type: request.data_type,
                        data_count: request.data_count as usize,
                        receiver,
                    },
                );
                // Every subscription starts with the current value
                replies.push(
                    self.make_monitor_update(
                        &pv_name,
                        request.data_type,
                        request.data_count as usize,
                        request.subscription_id,
                    )
                    .into(),
                );
            }
            Err(condition) => {
                warn!("Could not monitor {pv_name}: {condition}");
                replies.push(failure(condition).into());
            }
        }
    }

    /// Turn pending update notifications for one PV into outgoing updates.
    ///
    /// The broadcast payloads are only drained to detect activity: a burst
    /// of updates coalesces into a single response built from a fresh read,
    /// which also applies the provider's type shaping for the subscriber.
    fn pump_monitors(&mut self, pv_name: &str, replies: &mut Vec<Message>) {
        let mut pending = Vec::new();
        let mut closed = Vec::new();
        for (key, monitor) in self.monitors.iter_mut() {
            if monitor.pv_name != pv_name {
                continue;
            }
            let mut activity = false;
            loop {
                match monitor.receiver.try_recv() {
                    Ok(_) => activity = true,
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        trace!("Subscription {} skipped {skipped} updates", key.1);
                        activity = true;
                    }
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Closed) => {
                        closed.push(*key);
                        break;
                    }
                }
            }
            if activity {
                pending.push((key.1, monitor.data_type, monitor.data_count));
            }
        }
        for (subscription_id, data_type, data_count) in pending {
            replies.push(
                self.make_monitor_update(pv_name, data_type, data_count, subscription_id)
                    .into(),
            );
        }
        for key in closed {
            if let Some(monitor) = self.monitors.remove(&key) {
                debug!(
                    "Update stream for {} ended, dropping subscription {}",
                    monitor.pv_name, key.1
                );
                self.provider.cancel_monitor_value(
                    &monitor.pv_name,
                    monitor.subscriber_id,
                    monitor.data_type,
                    monitor.data_count,
                );
            }
        }
    }

    fn make_monitor_update(
        &self,
        pv_name: &str,
        data_type: DbrType,
        data_count: usize,
        subscription_id: u32,
    ) -> EventAddResponse {
        match self
            .provider
            .read_value(pv_name, Some(data_type))
            .and_then(|dbr| dbr.convert_to(data_type))
        {
            Ok(dbr) => {
                let (count, data) = dbr.to_bytes(NonZeroUsize::new(data_count));
                EventAddResponse {
                    data_type,
                    data_count: count as u32,
                    status: ErrorCondition::Normal.eca_code(),
                    subscription_id,
                    data,
                }
            }
            Err(condition) => EventAddResponse {
                data_type,
                data_count: 0,
                status: condition.eca_code(),
                subscription_id,
                data: Vec::new(),
            },
        }
    }

    /// Tell the provider about every subscription this circuit leaves behind
    fn release_monitors(&mut self) {
        for (_, monitor) in self.monitors.drain() {
            self.provider.cancel_monitor_value(
                &monitor.pv_name,
                monitor.subscriber_id,
                monitor.data_type,
                monitor.data_count,
            );
        }
    }
}
