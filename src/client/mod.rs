//! Client-side CA: outbound circuits and upstream PV resolution.

mod circuit;
mod resolve;

pub use circuit::{ChannelInfo, Circuit, ClientError};
pub use resolve::{RemoteDescriptor, ResolveError, resolve_pv};
