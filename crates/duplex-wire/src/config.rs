//! File configuration for a peer (`config.toml`).

use crate::frame::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};

/// On-disk peer configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    /// Display name announced to remote peers.
    pub name: String,
    /// Hex-encoded Ed25519 seed. Empty means a fresh key per run.
    pub private_key: String,
    /// Hex-encoded public keys allowed to connect. Empty pins the local
    /// key's own public half.
    pub authorized_keys: Vec<String>,
    /// Endpoints to listen on (`tcp://host:port`, `unix:///path`).
    pub listen: Vec<String>,
    pub handshake_timeout_secs: u64,
    pub greeting_timeout_secs: u64,
    /// Largest frame read or written on a channel, in bytes.
    pub max_frame_size: usize,
    /// Inbound channels buffered before producers wait.
    pub intake_capacity: usize,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            name: "duplex".to_string(),
            private_key: String::new(),
            authorized_keys: Vec::new(),
            listen: Vec::new(),
            handshake_timeout_secs: 10,
            greeting_timeout_secs: 10,
            max_frame_size: MAX_FRAME_SIZE,
            intake_capacity: 1024,
            log_level: "info".to_string(),
        }
    }
}
