//! Mirrored PVs: locally served rows that track PVs on another CA server
//! and hand writes back to them.
//!
//! Every mirrored name gets a [`MirrorEntry`]: the local value row, a
//! persistent upstream circuit, and a [`FeedbackGuard`]. A per-entry
//! bridge task subscribes upstream and applies each inbound update to
//! the local row under the guard; client writes are translated to the
//! remote native representation and forwarded upstream, with the local
//! row left untouched until the write echoes back through the
//! subscription.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio::{
    select,
    sync::{broadcast, mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{Circuit, ClientError, RemoteDescriptor, ResolveError, resolve_pv},
    dbr::{Dbr, DbrCategory, DbrType, DbrValue, MonitorMask},
    messages::{Access, EPICS_VERSION, ErrorCondition},
    providers::{
        Provider, WriteDisposition,
        local::{LocalPv, LocalPvSpec, translate_value},
    },
};

/// Backoff bounds for re-establishing a lost upstream subscription
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// Default bound on one forwarded write round trip
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default bound on resolving one PV at assembly time
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum MirrorError {
    #[error("connecting to {address} for '{pv_name}': {source}")]
    Connect {
        pv_name: String,
        address: SocketAddr,
        #[source]
        source: ClientError,
    },
    #[error("reading startup state of '{pv_name}': {source}")]
    Read {
        pv_name: String,
        #[source]
        source: ClientError,
    },
    #[error("decoding metadata of '{pv_name}': {reason}")]
    Decode { pv_name: String, reason: String },
    #[error("'{0}' is mirrored more than once")]
    DuplicateName(String),
}

impl MirrorError {
    fn from_resolve(pv_name: &str, address: &SocketAddr, error: ResolveError) -> MirrorError {
        let pv_name = pv_name.to_owned();
        match error {
            ResolveError::Connect(source) => MirrorError::Connect {
                pv_name,
                address: *address,
                source,
            },
            ResolveError::Read(source) => MirrorError::Read { pv_name, source },
            ResolveError::Decode(reason) => MirrorError::Decode { pv_name, reason },
        }
    }
}

/// Marks "an inbound subscription update is being applied" for one entry.
///
/// While held, a store arriving through the write path is that update
/// landing locally, not a client asking for a change, and must not be
/// forwarded back upstream. The hold is released in [`Drop`], on every
/// exit path. Holders never cross an await point, so on the cooperative
/// runtime no unrelated write can observe the guard held.
#[derive(Clone, Debug, Default)]
pub struct FeedbackGuard {
    applying: Arc<AtomicBool>,
}

impl FeedbackGuard {
    pub fn hold(&self) -> GuardHeld {
        self.applying.store(true, Ordering::Release);
        GuardHeld {
            applying: self.applying.clone(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.applying.load(Ordering::Acquire)
    }
}

/// A live hold on a [`FeedbackGuard`]. Dropping it releases the guard.
#[derive(Debug)]
pub struct GuardHeld {
    applying: Arc<AtomicBool>,
}

impl Drop for GuardHeld {
    fn drop(&mut self) {
        self.applying.store(false, Ordering::Release);
    }
}

/// Lifecycle of one entry's subscription bridge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BridgeState {
    #[default]
    Unstarted,
    /// Trying to establish (or re-establish) the upstream subscription
    Connecting,
    /// Live updates are flowing
    Subscribed,
    Terminated,
}

/// One mirrored PV: the local row, its upstream circuit, and the guard
struct MirrorEntry {
    /// The locally served name, prefix included
    local_name: String,
    descriptor: RemoteDescriptor,
    local: Mutex<LocalPv>,
    guard: FeedbackGuard,
    /// The persistent upstream circuit, while the bridge has one open
    circuit: Mutex<Option<Arc<Circuit>>>,
    bridge_state: watch::Sender<BridgeState>,
    write_timeout: Duration,
}

impl MirrorEntry {
    fn new(
        local_name: String,
        descriptor: RemoteDescriptor,
        force_read_only: bool,
        write_timeout: Duration,
    ) -> MirrorEntry {
        let spec = LocalPvSpec::from_descriptor(&descriptor, force_read_only);
        MirrorEntry {
            local: Mutex::new(LocalPv::from_spec(&local_name, spec)),
            local_name,
            descriptor,
            guard: FeedbackGuard::default(),
            circuit: Mutex::new(None),
            bridge_state: watch::Sender::new(BridgeState::Unstarted),
            write_timeout,
        }
    }

    /// Apply a value to this entry.
    ///
    /// With the feedback guard held this is the subscription bridge's own
    /// update landing: it is committed to the local row, remote timestamp
    /// preserved, and nothing goes back upstream. Otherwise it is a
    /// genuine client write: translated to the remote native type and
    /// forwarded, leaving the local row for the echo to update.
    async fn write(
        &self,
        value: &DbrValue,
        timestamp: Option<SystemTime>,
    ) -> Result<WriteDisposition, ErrorCondition> {
        if self.guard.is_held() {
            self.local
                .lock()
                .unwrap()
                .store_at(value, timestamp.unwrap_or_else(SystemTime::now))?;
            return Ok(WriteDisposition::Committed);
        }
        let translated = translate_value(
            value,
            self.descriptor.data_type,
            self.descriptor.enum_labels.as_deref(),
        )?;
        let circuit = self.circuit.lock().unwrap().clone();
        let Some(circuit) = circuit else {
            warn!(
                "Rejecting write to '{}': upstream is disconnected",
                self.local_name
            );
            return Err(ErrorCondition::Disconn);
        };
        match circuit
            .write_pv(&self.descriptor.pv_name, translated, self.write_timeout)
            .await
        {
            Ok(()) => Ok(WriteDisposition::ForwardedAwaitingEcho),
            Err(error) => {
                warn!(
                    "Forwarding write to '{}' failed: {error}",
                    self.descriptor.pv_name
                );
                Err(condition_for(error))
            }
        }
    }

    /// Apply one inbound subscription update to the local row
    async fn apply_update(&self, update: Dbr) {
        let timestamp = update.timestamp();
        let value = update.take_value();
        let hold = self.guard.hold();
        let applied = self.write(&value, timestamp).await;
        drop(hold);
        if let Err(error) = applied {
            error!(
                "Dropping inbound update for '{}': {error:?}",
                self.local_name
            );
        }
    }

    async fn open_subscription(&self) -> Result<broadcast::Receiver<Dbr>, ClientError> {
        let circuit =
            Circuit::connect(&self.descriptor.address, self.descriptor.protocol_version).await?;
        let receiver = circuit
            .subscribe(&self.descriptor.pv_name, DbrCategory::Time)
            .await?;
        *self.circuit.lock().unwrap() = Some(Arc::new(circuit));
        Ok(receiver)
    }

    /// Keep the upstream subscription alive until shutdown.
    ///
    /// On stream loss the last value stays served and the bridge retries
    /// with doubling backoff, forever.
    async fn bridge_lifecycle(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = RECONNECT_INITIAL;
        'bridge: loop {
            self.bridge_state.send_replace(BridgeState::Connecting);
            let mut receiver = select! {
                _ = cancel.cancelled() => break 'bridge,
                opened = self.open_subscription() => match opened {
                    Ok(receiver) => receiver,
                    Err(error) => {
                        warn!(
                            "Upstream connection for '{}' failed: {error}; retrying in {backoff:?}",
                            self.local_name
                        );
                        select! {
                            _ = cancel.cancelled() => break 'bridge,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                        continue;
                    }
                },
            };
            info!(
                "Mirroring '{}' from {} as '{}'",
                self.descriptor.pv_name, self.descriptor.address, self.local_name
            );
            self.bridge_state.send_replace(BridgeState::Subscribed);
            backoff = RECONNECT_INITIAL;
            loop {
                let update = select! {
                    _ = cancel.cancelled() => break 'bridge,
                    update = receiver.recv() => update,
                };
                match update {
                    Ok(update) => self.apply_update(update).await,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(
                            "Subscription for '{}' lagged by {count} updates",
                            self.local_name
                        );
                    }
                    // The circuit died underneath the subscription
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            if let Some(circuit) = self.circuit.lock().unwrap().take() {
                circuit.stop();
            }
            warn!(
                "Lost upstream circuit for '{}'; serving last value while reconnecting",
                self.local_name
            );
        }
        if let Some(circuit) = self.circuit.lock().unwrap().take() {
            circuit.stop();
        }
        self.bridge_state.send_replace(BridgeState::Terminated);
        debug!("Bridge for '{}' terminated", self.local_name);
    }
}

/// Map a circuit failure to the status code the writing client sees
fn condition_for(error: ClientError) -> ErrorCondition {
    match error {
        ClientError::WriteRejected(condition) | ClientError::ErrorResponse(condition) => condition,
        ClientError::Timeout => ErrorCondition::Timeout,
        ClientError::IO(_) | ClientError::CircuitClosed | ClientError::ChannelClosed => {
            ErrorCondition::Disconn
        }
        _ => ErrorCondition::PutFail,
    }
}

/// One row of mirror configuration: which remote PV to track, and where
#[derive(Clone, Debug)]
pub struct MirrorTarget {
    pub remote_name: String,
    pub address: SocketAddr,
    pub protocol_version: u16,
}

impl MirrorTarget {
    pub fn new(remote_name: &str, address: SocketAddr) -> MirrorTarget {
        MirrorTarget {
            remote_name: remote_name.to_owned(),
            address,
            protocol_version: EPICS_VERSION,
        }
    }

    pub fn protocol_version(mut self, protocol_version: u16) -> Self {
        self.protocol_version = protocol_version;
        self
    }
}

/// Collects mirror configuration, then resolves and registers every entry
pub struct MirrorBuilder {
    targets: Vec<MirrorTarget>,
    prefix: String,
    force_read_only: bool,
    write_timeout: Duration,
    resolve_timeout: Duration,
}

impl Default for MirrorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorBuilder {
    pub fn new() -> MirrorBuilder {
        MirrorBuilder {
            targets: Vec::new(),
            prefix: "mirror:".to_owned(),
            force_read_only: false,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    /// Prepended to every remote name to form the served name
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_owned();
        self
    }

    /// Serve every entry read-only, whatever the remote rights say
    pub fn force_read_only(mut self, force_read_only: bool) -> Self {
        self.force_read_only = force_read_only;
        self
    }

    /// Bound on one forwarded write round trip
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Bound on resolving each remote PV during [`MirrorBuilder::assemble`]
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn add_target(mut self, target: MirrorTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Mirror `remote_name` from `address` at the default protocol version
    pub fn add_pv(self, remote_name: &str, address: SocketAddr) -> Self {
        self.add_target(MirrorTarget::new(remote_name, address))
    }

    /// Resolve every target and build the serving provider.
    ///
    /// Targets are resolved one at a time, in order; the first failure
    /// abandons the whole assembly.
    pub async fn assemble(self) -> Result<MirrorProvider, MirrorError> {
        let mut entries = HashMap::new();
        for target in self.targets {
            let local_name = format!("{}{}", self.prefix, target.remote_name);
            if entries.contains_key(&local_name) {
                return Err(MirrorError::DuplicateName(local_name));
            }
            let descriptor = resolve_pv(
                &target.address,
                &target.remote_name,
                target.protocol_version,
                self.resolve_timeout,
            )
            .await
            .map_err(|error| {
                MirrorError::from_resolve(&target.remote_name, &target.address, error)
            })?;
            info!(
                "Mirroring {} element(s) of {:?} '{}' as '{local_name}'",
                descriptor.element_count, descriptor.data_type, target.remote_name
            );
            let entry = MirrorEntry::new(
                local_name.clone(),
                descriptor,
                self.force_read_only,
                self.write_timeout,
            );
            entries.insert(local_name, Arc::new(entry));
        }
        Ok(MirrorProvider {
            entries: Arc::new(entries),
        })
    }
}

/// Serves the mirrored entries and runs their subscription bridges
#[derive(Clone)]
pub struct MirrorProvider {
    entries: Arc<HashMap<String, Arc<MirrorEntry>>>,
}

impl MirrorProvider {
    fn get_entry(&self, pv_name: &str) -> Result<&Arc<MirrorEntry>, ErrorCondition> {
        self.entries
            .get(pv_name)
            .ok_or(ErrorCondition::UnavailInServ)
    }

    /// The locally served names, in no particular order
    pub fn pv_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Observe the bridge lifecycle of one served name
    pub fn watch_bridge(&self, pv_name: &str) -> Option<watch::Receiver<BridgeState>> {
        Some(self.entries.get(pv_name)?.bridge_state.subscribe())
    }
}

impl Provider for MirrorProvider {
    fn provides(&self, pv_name: &str) -> bool {
        self.entries.contains_key(pv_name)
    }

    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition> {
        let entry = self.get_entry(pv_name)?;
        Ok(entry.local.lock().unwrap().load_for_ca(requested_type))
    }

    fn get_access_right(
        &self,
        pv_name: &str,
        _client_user_name: Option<&str>,
        _client_host_name: Option<&str>,
    ) -> Access {
        match self.get_entry(pv_name) {
            Ok(entry) if entry.local.lock().unwrap().read_only => Access::Read,
            Ok(_) => Access::ReadWrite,
            Err(_) => Access::Deny,
        }
    }

    fn write_value(
        &mut self,
        pv_name: &str,
        value: Dbr,
    ) -> impl Future<Output = Result<WriteDisposition, ErrorCondition>> + Send {
        let entry = self.entries.get(pv_name).cloned();
        async move {
            let Some(entry) = entry else {
                return Err(ErrorCondition::UnavailInServ);
            };
            if entry.local.lock().unwrap().read_only {
                return Err(ErrorCondition::NoWtAccess);
            }
            debug!(
                "Mirror: processing write to '{}': {value:?}",
                entry.local_name
            );
            entry.write(value.value(), None).await
        }
    }

    fn monitor_value(
        &mut self,
        pv_name: &str,
        unique_subscriber_id: u64,
        _data_type: DbrType,
        _data_count: usize,
        _mask: MonitorMask,
        trigger: mpsc::Sender<String>,
    ) -> Result<broadcast::Receiver<Dbr>, ErrorCondition> {
        let entry = self.get_entry(pv_name)?;
        Ok(entry
            .local
            .lock()
            .unwrap()
            .monitor(unique_subscriber_id, trigger))
    }

    fn cancel_monitor_value(
        &mut self,
        pv_name: &str,
        unique_subscriber_id: u64,
        _data_type: DbrType,
        _data_count: usize,
    ) {
        let Ok(entry) = self.get_entry(pv_name) else {
            debug!("Got remove subscription for nonexistent subscription!");
            return;
        };
        entry.local.lock().unwrap().unmonitor(unique_subscriber_id);
    }

    fn attach(&mut self, shutdown: CancellationToken) {
        for entry in self.entries.values() {
            if *entry.bridge_state.borrow() != BridgeState::Unstarted {
                continue;
            }
            let entry = entry.clone();
            let cancel = shutdown.clone();
            tokio::spawn(entry.bridge_lifecycle(cancel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(value: DbrValue) -> RemoteDescriptor {
        RemoteDescriptor {
            pv_name: "SOURCE:VAL".to_owned(),
            address: "127.0.0.1:5064".parse().unwrap(),
            protocol_version: EPICS_VERSION,
            data_type: value.get_type(),
            element_count: value.get_count().max(1),
            read_access: true,
            write_access: true,
            enum_labels: None,
            initial_value: value,
        }
    }

    #[test]
    fn test_guard_scope() {
        let guard = FeedbackGuard::default();
        assert!(!guard.is_held());
        {
            let _hold = guard.hold();
            assert!(guard.is_held());
        }
        assert!(!guard.is_held());
    }

    #[tokio::test]
    async fn test_guarded_write_commits_locally() {
        let entry = MirrorEntry::new(
            "mirror:VAL".to_owned(),
            descriptor(DbrValue::Double(vec![3.14])),
            false,
            DEFAULT_WRITE_TIMEOUT,
        );
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100);
        let hold = entry.guard.hold();
        let disposition = entry
            .write(&DbrValue::Double(vec![2.71]), Some(stamp))
            .await
            .unwrap();
        drop(hold);
        assert_eq!(disposition, WriteDisposition::Committed);
        let served = entry.local.lock().unwrap().load_for_ca(None);
        assert_eq!(*served.value(), DbrValue::Double(vec![2.71]));
        assert_eq!(served.timestamp(), Some(stamp));
    }

    #[tokio::test]
    async fn test_unguarded_write_needs_upstream() {
        // With no circuit a client write fails and the row keeps its value
        let entry = MirrorEntry::new(
            "mirror:VAL".to_owned(),
            descriptor(DbrValue::Double(vec![3.14])),
            false,
            DEFAULT_WRITE_TIMEOUT,
        );
        assert_eq!(
            entry.write(&DbrValue::Double(vec![9.9]), None).await,
            Err(ErrorCondition::Disconn)
        );
        assert_eq!(
            entry.local.lock().unwrap().load(),
            DbrValue::Double(vec![3.14])
        );
    }

    #[tokio::test]
    async fn test_bad_write_rejected_before_forwarding() {
        let mut descriptor = descriptor(DbrValue::Enum(0));
        descriptor.enum_labels = Some(vec!["OFF".to_owned(), "ON".to_owned()]);
        let entry = MirrorEntry::new(
            "mirror:STATE".to_owned(),
            descriptor,
            false,
            DEFAULT_WRITE_TIMEOUT,
        );
        // An unknown state string never reaches the (absent) circuit
        assert_eq!(
            entry.write(&"MAYBE".into(), None).await,
            Err(ErrorCondition::NoConvert)
        );
    }

    #[test]
    fn test_forward_failure_conditions() {
        // Upstream verdicts pass through untouched
        assert_eq!(
            condition_for(ClientError::WriteRejected(ErrorCondition::NoWtAccess)),
            ErrorCondition::NoWtAccess
        );
        assert_eq!(
            condition_for(ClientError::ErrorResponse(ErrorCondition::BadType)),
            ErrorCondition::BadType
        );
        // A forwarded write nobody answered in time reports as a timeout
        assert_eq!(condition_for(ClientError::Timeout), ErrorCondition::Timeout);
        // Losing the upstream in any form is a disconnect
        assert_eq!(
            condition_for(ClientError::CircuitClosed),
            ErrorCondition::Disconn
        );
        assert_eq!(
            condition_for(ClientError::ChannelClosed),
            ErrorCondition::Disconn
        );
        assert_eq!(
            condition_for(ClientError::IO(std::io::ErrorKind::ConnectionReset.into())),
            ErrorCondition::Disconn
        );
        assert_eq!(
            condition_for(ClientError::ChannelCreateFailed),
            ErrorCondition::PutFail
        );
    }

    #[test]
    fn test_force_read_only() {
        let entry = MirrorEntry::new(
            "mirror:VAL".to_owned(),
            descriptor(DbrValue::Double(vec![3.14])),
            true,
            DEFAULT_WRITE_TIMEOUT,
        );
        assert!(entry.local.lock().unwrap().read_only);
    }
}
