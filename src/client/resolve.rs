//! Startup interrogation of an upstream PV.
//!
//! Before a mirror can serve a local row it needs to know what the remote
//! PV looks like: native type, element count, access rights, enum state
//! strings and a first value. [`resolve_pv`] opens a short-lived circuit,
//! gathers all of that with a single Control-category read, and tears the
//! connection down again.

use std::{net::SocketAddr, time::Duration};

use tracing::debug;

use crate::{
    client::{Circuit, ClientError},
    dbr::{DbrBasicType, DbrCategory, DbrValue},
};

/// Why resolution failed, split by phase so callers can report whether
/// the server was unreachable or merely unhelpful.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    /// Could not reach the server or open the channel
    #[error("{0}")]
    Connect(#[source] ClientError),
    /// The channel opened but the startup read failed
    #[error("{0}")]
    Read(#[source] ClientError),
    /// The read succeeded but the metadata was unusable
    #[error("{0}")]
    Decode(String),
}

/// Everything learned about a remote PV during resolution.
#[derive(Debug, Clone)]
pub struct RemoteDescriptor {
    pub pv_name: String,
    pub address: SocketAddr,
    pub protocol_version: u16,
    pub data_type: DbrBasicType,
    pub element_count: usize,
    pub read_access: bool,
    pub write_access: bool,
    /// State strings, for enum PVs only
    pub enum_labels: Option<Vec<String>>,
    pub initial_value: DbrValue,
}

/// Interrogate `pv_name` on the server at `address`.
///
/// The whole exchange is bounded by `timeout`, so a server that accepts
/// the connection but never answers the channel open or the read counts
/// as a failure rather than a hang. The transient circuit is torn down
/// on every exit path.
pub async fn resolve_pv(
    address: &SocketAddr,
    pv_name: &str,
    protocol_version: u16,
    timeout: Duration,
) -> Result<RemoteDescriptor, ResolveError> {
    match tokio::time::timeout(timeout, do_resolve(address, pv_name, protocol_version)).await {
        Ok(result) => result,
        // An unanswered open or read is a failed read, not a hang
        Err(_) => Err(ResolveError::Read(ClientError::Timeout)),
    }
}

async fn do_resolve(
    address: &SocketAddr,
    pv_name: &str,
    protocol_version: u16,
) -> Result<RemoteDescriptor, ResolveError> {
    let circuit = Circuit::connect(address, protocol_version)
        .await
        .map_err(ResolveError::Connect)?;
    let channel = circuit
        .get_channel(pv_name)
        .await
        .map_err(ResolveError::Connect)?;
    // A Control read carries limits and enum state strings along with the value
    let dbr = circuit
        .read_pv(pv_name, DbrCategory::Control)
        .await
        .map_err(ResolveError::Read)?;
    let enum_labels = dbr
        .graphics()
        .and_then(|graphics| graphics.enum_labels())
        .map(|labels| labels.to_vec());
    // An enum we cannot name states for cannot be mirrored faithfully
    if channel.native_type == DbrBasicType::Enum
        && enum_labels.as_ref().is_none_or(|labels| labels.is_empty())
    {
        return Err(ResolveError::Decode(
            "enum PV reported no state strings".to_owned(),
        ));
    }
    let descriptor = RemoteDescriptor {
        pv_name: pv_name.to_owned(),
        address: circuit.address(),
        protocol_version,
        data_type: channel.native_type,
        element_count: channel.native_count as usize,
        read_access: channel.permissions.can_read(),
        write_access: channel.permissions.can_write(),
        enum_labels,
        initial_value: dbr.take_value(),
    };
    debug!("Resolved {pv_name}: {descriptor:?}");
    Ok(descriptor)
}
