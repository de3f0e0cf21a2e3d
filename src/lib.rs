//! wininspectd - desktop inspection daemon.
//!
//! Exposes a framed JSON request/response protocol over two transports (a
//! local socket and TCP) through which clients enumerate, inspect, and
//! manipulate the windowing, process, registry, and input state of the
//! host. The OS-facing work is behind the [`backend::Backend`] capability;
//! this crate is the protocol, session, and snapshot engine:
//!
//! - [`protocol`]: wire framing, envelopes, canonical serialization
//! - [`registry`]: pinned, LRU-bounded snapshot store
//! - [`session`]: persistent per-client session records with TTL reaping
//! - [`auth`]: challenge/response handshake material
//! - [`dispatch`]: request routing under a watchdog
//! - [`server`] / [`tcp`] / [`discovery`]: listeners and the per-connection
//!   handler
//! - [`client`]: the matching client side

pub mod auth;
pub mod backend;
pub mod client;
pub mod discovery;
pub mod dispatch;
pub mod handle;
pub mod logbuf;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod tcp;
