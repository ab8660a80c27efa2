//! Interface between PV sources and the CA serving runtime

pub mod local;
pub mod mirror;

pub use local::{LocalProvider, LocalPvSpec, PvHandle};
pub use mirror::{
    BridgeState, FeedbackGuard, MirrorBuilder, MirrorError, MirrorProvider, MirrorTarget,
};

use std::future::Future;

use tokio::sync::{
    broadcast::{self},
    mpsc::{self},
};
use tokio_util::sync::CancellationToken;

use crate::{
    dbr::{Dbr, DbrType, MonitorMask},
    messages::{self, ErrorCondition},
};

/// How a provider satisfied a completed write.
///
/// A rejected write is not a disposition: it travels back as the `Err`
/// arm and from there into the WRITE_NOTIFY status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// The write was handed to an upstream source. The local value is not
    /// yet updated; the authoritative new value arrives back through the
    /// provider's own update stream.
    ForwardedAwaitingEcho,
    /// The value was committed directly to the locally served store.
    Committed,
}

/// Provides PV values for a CAServer
pub trait Provider: Sync + Send + Clone + 'static {
    /// Does this provider control the given PV name?
    fn provides(&self, pv_name: &str) -> bool;

    /// Fetch a single PV value.
    ///
    /// The type requested by the caller is provided, but this is only
    /// a request - you can return any type you wish from this function,
    /// and it will be automatically converted to the target type (if
    /// such a safe conversion exists).
    ///
    /// The record that you return with no requested_type is used for
    /// the native type and data count that is reported to new subscribers.
    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition>;

    #[allow(unused_variables)]
    fn get_access_right(
        &self,
        pv_name: &str,
        client_user_name: Option<&str>,
        client_host_name: Option<&str>,
    ) -> messages::Access {
        messages::Access::Read
    }

    /// Write a value sent by a client to a PV
    ///
    /// There is no type information - data sent from caput appears to
    /// always be as a string?
    ///
    /// Asynchronous because a provider may need to consult an upstream
    /// source before the write outcome is known.
    #[allow(unused_variables)]
    fn write_value(
        &mut self,
        pv_name: &str,
        value: Dbr,
    ) -> impl Future<Output = Result<WriteDisposition, ErrorCondition>> + Send {
        async { Err(ErrorCondition::NoWtAccess) }
    }

    /// Request setting up a subscription to a PV
    #[allow(unused_variables)]
    fn monitor_value(
        &mut self,
        pv_name: &str,
        unique_subscriber_id: u64,
        data_type: DbrType,
        data_count: usize,
        mask: MonitorMask,
        trigger: mpsc::Sender<String>,
    ) -> Result<broadcast::Receiver<Dbr>, ErrorCondition> {
        Err(ErrorCondition::UnavailInServ)
    }

    #[allow(unused_variables)]
    fn cancel_monitor_value(
        &mut self,
        pv_name: &str,
        unique_subscriber_id: u64,
        data_type: DbrType,
        data_count: usize,
    ) {
    }

    /// Called once by the serving runtime after its listeners are live.
    ///
    /// Providers that drive their values from elsewhere start their
    /// background work here. `shutdown` is cancelled when the server
    /// stops, and any spawned tasks should end with it.
    #[allow(unused_variables)]
    fn attach(&mut self, shutdown: CancellationToken) {}
}
