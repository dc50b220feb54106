//! Duplex CLI: run a peer, generate keys, and poke at remote services.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    let loaded = config::load_config(cli.config.as_deref());
    init_tracing_stderr(&loaded.config.log_level);
    match &loaded.warning {
        Some(warning) => tracing::warn!("{warning}"),
        None => tracing::debug!(path = %loaded.path.display(), "Configuration ready"),
    }

    match cli.command {
        Commands::Keygen => cmd::key::cmd_keygen(),
        Commands::Whoami => cmd::key::cmd_whoami(&loaded.config),
        Commands::Listen { endpoints } => cmd::peer::cmd_listen(&loaded.config, endpoints),
        Commands::Send {
            endpoint,
            message,
            service,
            headers,
        } => cmd::peer::cmd_send(&loaded.config, &endpoint, &service, headers, &message),
    }
}
