//! Wire records exchanged on top of the transport.
//!
//! Records are MessagePack-encoded in compact (array) form, so field order
//! is part of the wire contract.

use serde::{Deserialize, Serialize};

/// Channel type token identifying a sub-channel as a duplex channel.
pub const CHANNEL_TYPE: &str = "@duplex";

/// Name of the out-of-band request carrying the acceptor's display name.
pub const GREETING_REQUEST: &str = "@duplex-greeting";

/// Name of the keepalive request. Peers answer it negatively.
pub const KEEPALIVE_REQUEST: &str = "keepalive@duplex";

/// Rejection message for channel-open metadata that does not decode.
pub const REJECT_PARSE: &str = "failed to parse channel data";

/// Rejection message for a channel-open with an empty service.
pub const REJECT_EMPTY_SERVICE: &str = "empty service";

/// Metadata attached to a duplex channel-open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Application protocol carried by the channel.
    pub service: String,
    /// Opaque headers, carried but not interpreted.
    pub headers: Vec<String>,
}

impl ChannelMeta {
    /// Create metadata for a channel carrying `service`.
    pub fn new(service: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            service: service.into(),
            headers,
        }
    }
}

/// Payload of the greeting request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingPayload {
    /// Display name of the accepting peer.
    pub name: String,
}

/// Encode a wire record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(value)
}

/// Decode a wire record.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}
