//! Command implementations.

pub mod key;
pub mod peer;

use crate::ui;
use duplex_wire::{DuplexConfig, PeerConfig};

/// Build the runtime peer config, exiting with a hint if the file config is unusable.
pub(crate) fn peer_config(config: &DuplexConfig) -> PeerConfig {
    match PeerConfig::from_config(config) {
        Ok(peer_config) => peer_config,
        Err(e) => {
            ui::error_with_fix(
                &format!("Invalid configuration: {e}"),
                "Run `duplex keygen` and set private_key in ~/.duplex/config.toml",
            );
            std::process::exit(1);
        }
    }
}

pub(crate) fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    }
}
