//! Listener: accepts inbound connections and turns them into peers.
//!
//! Each accepted stream is handled on its own task: transport handshake,
//! greeting (acceptor role), registration, then the channel accept loop.
//! A failing connection is logged and dropped while the listener keeps
//! running. A failing `accept` stops the listener and unbinds it.

use crate::accept;
use crate::connection::PeerConnection;
use crate::endpoint::{BoxedConn, Endpoint};
use crate::error::WireError;
use crate::greeting;
use crate::peer::{Peer, WeakPeer};
use crate::transport::{discard_requests, Session};
use std::io;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::net::UnixListener;

/// A bound listener owned by a [`Peer`].
#[derive(Debug)]
pub struct PeerListener {
    endpoint: Endpoint,
    task: JoinHandle<()>,
}

impl PeerListener {
    /// The endpoint actually bound (a TCP port 0 is resolved).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop accepting and remove the socket file of a Unix listener.
    /// Established connections are unaffected.
    pub(crate) fn close(self) {
        self.task.abort();
        if let Endpoint::Unix(path) = &self.endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("duplex: failed to remove {}: {}", path.display(), e);
                }
            }
        }
        info!("duplex: stopped listening on {}", self.endpoint);
    }
}

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, String),
}

impl Bound {
    async fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint), WireError> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = Endpoint::Tcp(listener.local_addr()?.to_string());
                Ok((Bound::Tcp(listener), local))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("duplex: removed stale socket {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = UnixListener::bind(path)?;
                Ok((Bound::Unix(listener, endpoint.to_string()), endpoint.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(WireError::InvalidEndpoint(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    /// Accept one stream and name its remote address.
    ///
    /// Unix peers are unnamed, so they get a per-listener sequence number.
    async fn accept(&self, seq: &mut u64) -> io::Result<(BoxedConn, String)> {
        match self {
            Bound::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("duplex: set_nodelay failed for {}: {}", addr, e);
                }
                Ok((Box::new(stream), format!("tcp://{addr}")))
            }
            #[cfg(unix)]
            Bound::Unix(listener, local) => {
                let (stream, _) = listener.accept().await?;
                *seq += 1;
                Ok((Box::new(stream), format!("{local}#{seq}")))
            }
        }
    }
}

/// Bind `endpoint` and start accepting connections for `peer`.
pub(crate) async fn listen(peer: &Peer, endpoint: &Endpoint) -> Result<PeerListener, WireError> {
    let (bound, local) = Bound::bind(endpoint).await?;
    info!("duplex: listening on {}", local);
    let task = tokio::spawn(accept_loop(bound, local.clone(), peer.downgrade()));
    Ok(PeerListener {
        endpoint: local,
        task,
    })
}

async fn accept_loop(bound: Bound, local: Endpoint, peer: WeakPeer) {
    let mut seq = 0u64;
    loop {
        let (stream, addr) = match bound.accept(&mut seq).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("duplex: accept error on {}: {}", local, e);
                break;
            }
        };
        let Some(peer) = peer.upgrade() else {
            return;
        };
        debug!("duplex: accepted connection from {}", addr);
        tokio::spawn(async move {
            if let Err(e) = handle_conn(peer, stream, addr.clone()).await {
                warn!("duplex: inbound connection from {} failed: {}", addr, e);
            }
        });
    }
    if let Some(peer) = peer.upgrade() {
        peer.forget_listener(&local);
    }
}

async fn handle_conn(peer: Peer, stream: BoxedConn, addr: String) -> Result<(), WireError> {
    let config = peer.config();
    let (session, incoming) = Session::server(stream, peer.transport_config()).await?;

    if let Err(e) = greeting::greet(&session, &config.name, config.greeting_timeout).await {
        session.close();
        return Err(e);
    }
    tokio::spawn(discard_requests(incoming.requests));

    let name = session.remote_user().to_string();
    let conn = PeerConnection::new(addr.clone(), name, session, config.max_frame_size);
    tokio::spawn(accept::accept_channels(
        incoming.channels,
        peer.intake(),
        config.max_frame_size,
        addr,
    ));
    peer.track(conn.clone());
    info!("duplex: peer {} connected from {}", conn.name(), conn.addr());
    Ok(())
}
