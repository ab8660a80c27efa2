// #![warn(missing_docs)]

//! Serve EPICS Channel Access PVs that mirror PVs owned by another server.
//!
//! This crate is a pure-rust implementation of the [EPICS CA protocol],
//! shaped around one job: standing up a local CA server whose PVs shadow
//! PVs that live on another IOC, and keeping the two in step. It does not
//! depend on the C-based [epics-base] project at all.
//!
//! Each mirrored PV is fed by a subscription to its remote counterpart, so
//! local reads and monitors are answered instantly from the latest known
//! value. Writes to the local copy are forwarded upstream and only take
//! effect here once the remote server publishes them back, which keeps the
//! remote PV authoritative and stops update/write feedback loops.
//!
//! The pieces:
//!
//! - Mapping and serialization/deserialization of message types, in module
//!   [messages].
//! - Representing data for transferring back and forth (["DBR" types]) via CA
//!   in module [dbr].
//! - A [client] layer that opens circuits to remote servers, inspects
//!   channels, reads, writes and subscribes.
//! - A server, configured through [ServerBuilder], that answers searches,
//!   accepts connections and serves values to clients.
//! - [Provider], the trait the server uses to talk to values in your
//!   application.
//! - Built-in [providers]:
//!   - [`providers::LocalProvider`]: a table of locally owned PVs, described
//!     by plain [`providers::LocalPvSpec`] rows.
//!   - [`providers::MirrorProvider`]: locally served PVs that shadow PVs on
//!     an upstream server, forwarding writes and applying remote updates
//!     without reflecting them back.
//!
//! ## Example
//!
//! Mirror `BL01:COUNTER` from another IOC and serve it locally as
//! `mirror:BL01:COUNTER`. `caget`, `caput` and `camonitor` all work against
//! the copy, and any write travels upstream before it shows up here:
//!
//! ```no_run
//! use camirror::{
//!     ServerBuilder,
//!     providers::{MirrorBuilder, MirrorTarget},
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let upstream = "192.168.1.5:5064".parse().unwrap();
//!     let provider = MirrorBuilder::default()
//!         .add_target(MirrorTarget::new("BL01:COUNTER", upstream))
//!         .assemble()
//!         .await
//!         .unwrap();
//!     let server = ServerBuilder::new(provider).start().await.unwrap();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     server.stop().await.unwrap();
//! }
//! ```
//!
//! ## Current Status of crate
//!
//! What is currently present:
//! - Replying to searches, accepting connections, and serving values to
//!   clients, including `camonitor` subscription updates.
//! - Mirroring: channels are resolved on the upstream server at startup,
//!   local copies are fed by subscription, writes forward upstream, and a
//!   lost circuit is retried with backoff while the last known value stays
//!   served.
//! - Translating values between different data types upon request; you can
//!   `caget` an e.g. [i8] as an [i32] and this will automatically convert.
//!   Enum PVs carry their state strings, so string reads and writes of an
//!   enum translate through the label list.
//! - Preserving remote timestamps: a mirrored update is served with the time
//!   the remote server stamped it, not the time it arrived here.
//!
//! What this doesn't do (yet):
//! - Locate upstream PVs by broadcast search; a mirror dials the named
//!   host and port directly.
//! - Register with a CA repeater.
//! - Serve the full `CTRL`/`GR` metadata categories beyond what mirrors
//!   need: enum state strings are carried, numeric display limits are not.
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;

pub mod dbr;
pub mod messages;

pub use crate::providers::{Provider, WriteDisposition};

mod server;
pub use crate::server::{ServerBuilder, ServerHandle};

pub mod providers;

mod utils;
