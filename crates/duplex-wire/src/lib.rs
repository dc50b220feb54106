//! Duplex: peer-to-peer service channels over authenticated connections.
//!
//! Two peers establish a mutually authenticated connection, exchange
//! display names, then multiplex any number of independent channels over
//! it. Each channel carries a service name and headers and exchanges
//! length-prefixed frames, with a separate error sub-stream.
//!
//! ## Architecture
//!
//! - **Peer**: local identity, listeners, connection registry and the
//!   intake queue of inbound channels
//! - **PeerConnection**: one authenticated, named session; opens channels
//! - **Channel**: framed duplex pipe tagged with service metadata
//! - **PeerRegistry**: live connections keyed by remote address
//! - **transport**: bundled authenticated multiplexer the protocol runs on

mod accept;
pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod greeting;
pub mod keys;
mod listener;
pub mod message;
pub mod peer;
pub mod registry;
pub mod transport;

pub use auth::{AllowList, Authorizer, PinnedKey, SharedAuthorizer};
pub use channel::Channel;
pub use config::DuplexConfig;
pub use connection::PeerConnection;
pub use endpoint::Endpoint;
pub use error::{WireError, WireResult};
pub use message::ChannelMeta;
pub use peer::{Peer, PeerConfig};
pub use registry::PeerRegistry;
pub use transport::RejectionReason;
