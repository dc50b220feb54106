//! Clap CLI definitions for Duplex.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  duplex keygen                               Generate a key pair
  duplex listen tcp://0.0.0.0:7400            Serve the echo service
  duplex send tcp://10.0.0.5:7400 hello       Send one frame, print the reply
  duplex send unix:///run/duplex.sock --service echo --header v=1 hi

\x1b[1;36mConfig:\x1b[0m
  ~/.duplex/config.toml (override with --config)";

/// Duplex: peer-to-peer service channels over authenticated connections.
#[derive(Parser)]
#[command(name = "duplex", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new Ed25519 key pair and print it as hex.
    Keygen,
    /// Show the configured name and public key.
    Whoami,
    /// Listen for peers and serve the built-in echo service.
    Listen {
        /// Endpoints to bind (defaults to `listen` in the config).
        endpoints: Vec<String>,
    },
    /// Open a channel, send one frame and print the reply.
    Send {
        /// Endpoint to dial (`tcp://host:port` or `unix:///path`).
        endpoint: String,
        /// Message to send.
        message: String,
        /// Service to open.
        #[arg(long, default_value = "echo")]
        service: String,
        /// Header to attach (repeatable).
        #[arg(long = "header")]
        headers: Vec<String>,
    },
}
