//! PeerConnection: one authenticated, named session with a remote peer.
//!
//! A connection only exists once the greeting has completed, so every
//! handle handed out is ready for [`PeerConnection::open`].

use crate::accept;
use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::greeting;
use crate::message::{self, ChannelMeta, CHANNEL_TYPE, KEEPALIVE_REQUEST};
use crate::peer::Peer;
use crate::transport::{discard_requests, Session};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ConnectionInner {
    addr: String,
    name: String,
    session: Session,
    connected_at: DateTime<Utc>,
    max_frame_size: usize,
}

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnectionInner>,
}

impl PeerConnection {
    pub(crate) fn new(
        addr: String,
        name: String,
        session: Session,
        max_frame_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                addr,
                name,
                session,
                connected_at: Utc::now(),
                max_frame_size,
            }),
        }
    }

    /// Remote display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Remote address (`tcp://host:port` or `unix:///path`).
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// When the greeting completed.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Underlying transport session.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Open a channel carrying `service` and `headers`.
    ///
    /// The returned channel reports the metadata given here; the remote
    /// either accepts it as is or rejects the open.
    pub async fn open(&self, service: &str, headers: Vec<String>) -> Result<Channel, WireError> {
        let meta = ChannelMeta::new(service, headers);
        let extra = message::encode(&meta)?;
        let (inner, requests) = self
            .inner
            .session
            .open_channel(CHANNEL_TYPE, Bytes::from(extra))
            .await?;
        tokio::spawn(discard_requests(requests));
        debug!(peer = %self.inner.addr, service, "Opened channel");
        Ok(Channel::new(inner, meta, self.inner.max_frame_size))
    }

    /// Check the connection with a keepalive request.
    ///
    /// Peers decline keepalives, so a live connection answers `Ok(false)`.
    pub async fn keepalive(&self) -> Result<bool, WireError> {
        let (ok, _) = self
            .inner
            .session
            .send_request(KEEPALIVE_REQUEST, true, Bytes::new())
            .await?;
        Ok(ok)
    }

    /// Close the connection. Blocked readers on its channels are aborted.
    pub fn disconnect(&self) {
        self.inner.session.close();
    }

    /// Whether the underlying session has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.session.is_closed()
    }

    /// Wait until the connection is closed by either side.
    pub async fn closed(&self) {
        self.inner.session.closed().await
    }

    pub(crate) fn same_connection(&self, other: &PeerConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || self.inner.session.same_session(&other.inner.session)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.inner.addr)
            .field("name", &self.inner.name)
            .field("connected_at", &self.inner.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dial `endpoint`, authenticate, wait for the greeting and register the
/// connection with `peer`.
pub(crate) async fn dial(peer: &Peer, endpoint: &Endpoint) -> Result<PeerConnection, WireError> {
    let config = peer.config();
    info!("duplex: connecting to peer at {}", endpoint);

    let stream = endpoint.connect().await?;
    let (session, incoming) =
        Session::client(stream, peer.transport_config(), &config.name).await?;

    let name = match greeting::await_greeting(incoming.requests, config.greeting_timeout).await {
        Ok(name) => name,
        Err(e) => {
            warn!("duplex: greeting from {} failed: {}", endpoint, e);
            session.close();
            return Err(e);
        }
    };

    let addr = endpoint.to_string();
    let conn = PeerConnection::new(addr.clone(), name, session, config.max_frame_size);
    tokio::spawn(accept::accept_channels(
        incoming.channels,
        peer.intake(),
        config.max_frame_size,
        addr,
    ));
    peer.track(conn.clone());
    info!("duplex: connected to {} ({})", conn.name(), conn.addr());
    Ok(conn)
}
