//! Peer commands: serve channels, or send a single frame.

use crate::ui;
use duplex_wire::{keys, Channel, DuplexConfig, Endpoint, Peer, WireError};
use tracing::{debug, info};

/// Service answered by `duplex listen`: every frame is sent back.
const ECHO_SERVICE: &str = "echo";

fn parse_endpoint(raw: &str) -> Endpoint {
    match raw.parse() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            ui::error_with_fix(
                &format!("{e}"),
                "Use tcp://host:port or unix:///path/to.sock",
            );
            std::process::exit(1);
        }
    }
}

pub fn cmd_listen(config: &DuplexConfig, endpoints: Vec<String>) {
    let endpoints: Vec<Endpoint> = if endpoints.is_empty() {
        config.listen.iter().map(|e| parse_endpoint(e)).collect()
    } else {
        endpoints.iter().map(|e| parse_endpoint(e)).collect()
    };
    if endpoints.is_empty() {
        ui::error_with_fix(
            "No endpoints to listen on",
            "Pass one (duplex listen tcp://0.0.0.0:7400) or set `listen` in the config",
        );
        std::process::exit(1);
    }

    let peer = Peer::new(super::peer_config(config));
    let rt = super::runtime();
    rt.block_on(async {
        ui::banner();
        ui::blank();
        ui::kv("Name", peer.name());
        ui::kv("Fingerprint", &keys::fingerprint(&peer.public_key()));
        for endpoint in &endpoints {
            match peer.bind(endpoint).await {
                Ok(bound) => ui::kv_ok("Listening", &bound.to_string()),
                Err(e) => {
                    ui::error(&format!("Failed to listen on {endpoint}: {e}"));
                    peer.shutdown();
                    std::process::exit(1);
                }
            }
        }
        ui::blank();
        ui::hint("Press Ctrl+C to stop.");

        loop {
            tokio::select! {
                channel = peer.accept() => match channel {
                    Some(channel) => {
                        tokio::spawn(serve(channel));
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    peer.shutdown();
                    break;
                }
            }
        }
    });
}

async fn serve(mut channel: Channel) {
    let service = channel.service().to_string();
    debug!(service = %service, headers = ?channel.headers(), "Serving channel");
    if service != ECHO_SERVICE {
        let message = format!("unknown service: {service}");
        if let Err(e) = channel.write_error(message.as_bytes()).await {
            debug!(error = %e, "Failed to report unknown service");
        }
        let _ = channel.close().await;
        return;
    }

    loop {
        match channel.read_frame().await {
            Ok(frame) => {
                if let Err(e) = channel.write_frame(&frame).await {
                    debug!(error = %e, "Echo write failed");
                    break;
                }
            }
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!(error = %e, "Echo read failed");
                break;
            }
        }
    }
    let _ = channel.close().await;
}

pub fn cmd_send(
    config: &DuplexConfig,
    endpoint: &str,
    service: &str,
    headers: Vec<String>,
    message: &str,
) {
    let endpoint = parse_endpoint(endpoint);
    let peer = Peer::new(super::peer_config(config));
    let rt = super::runtime();

    // Outer error: transport or protocol failure. Inner error: the remote
    // service answered on the error stream.
    let result: Result<Result<Vec<u8>, String>, WireError> = rt.block_on(async {
        let conn = peer.connect(&endpoint).await?;
        ui::kv("Connected", &format!("{} ({})", conn.name(), conn.addr()));

        let mut channel = conn.open(service, headers).await?;
        channel.write_frame(message.as_bytes()).await?;
        channel.close_write().await?;

        let reply = match channel.read_frame().await {
            Ok(reply) => Ok(Ok(reply)),
            Err(read_err) => match channel.read_error().await {
                Ok(remote) => Ok(Err(String::from_utf8_lossy(&remote).into_owned())),
                Err(_) => Err(read_err),
            },
        };
        peer.shutdown();
        reply
    });

    match result {
        Ok(Ok(reply)) => ui::success(&String::from_utf8_lossy(&reply)),
        Ok(Err(remote)) => {
            ui::error(&format!("Remote error: {remote}"));
            std::process::exit(1);
        }
        Err(e) => {
            ui::error(&format!("Send failed: {e}"));
            std::process::exit(1);
        }
    }
}
