//! Key commands.

use crate::ui;
use duplex_wire::{keys, DuplexConfig};

pub fn cmd_keygen() {
    let key = keys::generate();
    let public = key.verifying_key();

    ui::section("New key pair");
    ui::kv("Private key", &keys::signing_key_hex(&key));
    ui::kv("Public key", &keys::verifying_key_hex(&public));
    ui::kv("Fingerprint", &keys::fingerprint(&public));
    ui::blank();
    ui::hint("Put the private key in ~/.duplex/config.toml as private_key = \"...\"");
}

pub fn cmd_whoami(config: &DuplexConfig) {
    let peer_config = super::peer_config(config);
    let public = peer_config.signing_key.verifying_key();

    ui::section("Local identity");
    ui::kv("Name", &peer_config.name);
    ui::kv("Public key", &keys::verifying_key_hex(&public));
    ui::kv_ok("Fingerprint", &keys::fingerprint(&public));
    if config.private_key.trim().is_empty() {
        ui::hint("No private_key configured; this key is ephemeral.");
    }
}
