//! Peer: the process-wide participant in the duplex protocol.
//!
//! A [`Peer`] owns the local identity, the listeners it has bound, the
//! registry of live connections, and the intake queue that receives every
//! channel opened toward it on any connection. Connections are made either
//! by dialing ([`Peer::connect`]) or by accepting on a bound endpoint
//! ([`Peer::bind`]); once established the protocol is symmetric and either
//! side may open channels.

use crate::auth::{AllowList, PinnedKey, SharedAuthorizer};
use crate::channel::Channel;
use crate::config::DuplexConfig;
use crate::connection::{self, PeerConnection};
use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::frame::MAX_FRAME_SIZE;
use crate::greeting::DEFAULT_GREETING_TIMEOUT;
use crate::keys;
use crate::listener::{self, PeerListener};
use crate::registry::PeerRegistry;
use crate::transport::session::wait_closed;
use crate::transport::{TransportConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default number of inbound channels buffered before producers wait.
pub const DEFAULT_INTAKE_CAPACITY: usize = 1024;

/// Runtime configuration for a [`Peer`].
#[derive(Clone)]
pub struct PeerConfig {
    /// Display name announced to remote peers.
    pub name: String,
    pub signing_key: SigningKey,
    /// Which remote keys may connect, and which hosts we accept when dialing.
    pub authorizer: SharedAuthorizer,
    pub handshake_timeout: Duration,
    /// Bound on waiting for the greeting (dialing) or its acknowledgement
    /// (accepting).
    pub greeting_timeout: Duration,
    pub max_frame_size: usize,
    pub intake_capacity: usize,
}

impl PeerConfig {
    /// A config that trusts only `signing_key`'s own public half.
    pub fn new(name: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            name: name.into(),
            authorizer: Arc::new(PinnedKey::new(signing_key.verifying_key())),
            signing_key,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            greeting_timeout: DEFAULT_GREETING_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
        }
    }

    /// Build a runtime config from file configuration.
    pub fn from_config(config: &DuplexConfig) -> Result<Self, WireError> {
        let signing_key = if config.private_key.trim().is_empty() {
            warn!("No private key configured, generating an ephemeral one");
            keys::generate()
        } else {
            keys::parse_signing_key(&config.private_key)?
        };

        let mut peer_config = Self::new(config.name.clone(), signing_key);
        if !config.authorized_keys.is_empty() {
            let keys = config
                .authorized_keys
                .iter()
                .map(|k| keys::parse_verifying_key(k))
                .collect::<Result<Vec<_>, _>>()?;
            peer_config.authorizer = Arc::new(AllowList::new(keys));
        }
        peer_config.handshake_timeout = Duration::from_secs(config.handshake_timeout_secs);
        peer_config.greeting_timeout = Duration::from_secs(config.greeting_timeout_secs);
        peer_config.max_frame_size = config.max_frame_size;
        peer_config.intake_capacity = config.intake_capacity;
        Ok(peer_config)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new("duplex", keys::generate())
    }
}

impl std::fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConfig")
            .field("name", &self.name)
            .field("public_key", &keys::fingerprint(&self.signing_key.verifying_key()))
            .field("handshake_timeout", &self.handshake_timeout)
            .field("greeting_timeout", &self.greeting_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("intake_capacity", &self.intake_capacity)
            .finish()
    }
}

struct PeerInner {
    config: PeerConfig,
    transport: TransportConfig,
    registry: PeerRegistry,
    listeners: Mutex<HashMap<String, PeerListener>>,
    /// One gate per endpoint so concurrent `open` calls share a single dial.
    dials: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    intake_tx: mpsc::Sender<Channel>,
    intake_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    shutdown: watch::Sender<bool>,
}

/// The local peer. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

/// Non-owning handle held by listener tasks.
pub(crate) struct WeakPeer(Weak<PeerInner>);

impl WeakPeer {
    pub(crate) fn upgrade(&self) -> Option<Peer> {
        self.0.upgrade().map(|inner| Peer { inner })
    }
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let transport = TransportConfig {
            signing_key: config.signing_key.clone(),
            authorizer: Arc::clone(&config.authorizer),
            handshake_timeout: config.handshake_timeout,
        };
        Self {
            inner: Arc::new(PeerInner {
                config,
                transport,
                registry: PeerRegistry::new(),
                listeners: Mutex::new(HashMap::new()),
                dials: Mutex::new(HashMap::new()),
                intake_tx,
                intake_rx: tokio::sync::Mutex::new(intake_rx),
                shutdown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.inner.config.signing_key.verifying_key()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Start listening on `endpoint`. Returns the endpoint actually bound.
    ///
    /// Rebinding an endpoint this peer already listens on replaces the old
    /// listener.
    pub async fn bind(&self, endpoint: &Endpoint) -> Result<Endpoint, WireError> {
        let previous = self.lock_listeners().remove(&endpoint.to_string());
        if let Some(previous) = previous {
            previous.close();
        }
        let listener = listener::listen(self, endpoint).await?;
        let bound = listener.endpoint().clone();
        self.lock_listeners().insert(bound.to_string(), listener);
        Ok(bound)
    }

    /// Stop listening on a previously bound endpoint.
    pub fn unbind(&self, endpoint: &Endpoint) -> Result<(), WireError> {
        let listener = self
            .lock_listeners()
            .remove(&endpoint.to_string())
            .ok_or_else(|| WireError::NotFound(format!("listener {endpoint}")))?;
        listener.close();
        Ok(())
    }

    /// Endpoints currently bound, sorted.
    pub fn listeners(&self) -> Vec<Endpoint> {
        let listeners = self.lock_listeners();
        let mut endpoints: Vec<Endpoint> =
            listeners.values().map(|l| l.endpoint().clone()).collect();
        endpoints.sort_by_key(|e| e.to_string());
        endpoints
    }

    /// Dial `endpoint` and complete the greeting.
    ///
    /// The connection is registered under the endpoint string; an existing
    /// connection to the same endpoint is closed.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<PeerConnection, WireError> {
        connection::dial(self, endpoint).await
    }

    /// Close and forget the connection registered under `addr`.
    pub fn disconnect(&self, addr: &str) -> Result<(), WireError> {
        let conn = self
            .inner
            .registry
            .remove(addr)
            .ok_or_else(|| WireError::NotFound(format!("connection {addr}")))?;
        conn.disconnect();
        Ok(())
    }

    /// Every live connection, dialed or accepted.
    pub fn connections(&self) -> Vec<PeerConnection> {
        self.inner.registry.all()
    }

    /// The connection registered under `addr`, if any.
    pub fn connection(&self, addr: &str) -> Option<PeerConnection> {
        self.inner.registry.get(addr)
    }

    /// Next channel opened toward this peer on any connection.
    ///
    /// Returns `None` once the peer is shut down.
    pub async fn accept(&self) -> Option<Channel> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut intake = self.inner.intake_rx.lock().await;
        let channel = tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => None,
            channel = intake.recv() => channel,
        };
        if channel.is_none() {
            close_intake(&mut intake);
        }
        channel
    }

    /// Open a channel to `endpoint`, dialing first if not connected.
    ///
    /// Concurrent calls for the same endpoint share one dial.
    pub async fn open(
        &self,
        endpoint: &Endpoint,
        service: &str,
        headers: Vec<String>,
    ) -> Result<Channel, WireError> {
        let addr = endpoint.to_string();
        let conn = match self.live_connection(&addr) {
            Some(conn) => conn,
            None => {
                let gate = self.dial_gate(&addr);
                let _dialing = gate.lock().await;
                match self.live_connection(&addr) {
                    Some(conn) => conn,
                    None => self.connect(endpoint).await?,
                }
            }
        };
        conn.open(service, headers).await
    }

    /// Close every listener and connection.
    ///
    /// Channels still queued for [`accept`](Self::accept) are dropped, and
    /// opens waiting for queue room are refused.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        // A running `accept` holds the lock and closes the queue itself.
        if let Ok(mut intake) = self.inner.intake_rx.try_lock() {
            close_intake(&mut intake);
        }
        let listeners: Vec<PeerListener> = self.lock_listeners().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.close();
        }
        for conn in self.inner.registry.drain() {
            conn.disconnect();
        }
        info!("duplex: peer {} shut down", self.name());
    }

    fn live_connection(&self, addr: &str) -> Option<PeerConnection> {
        self.inner.registry.get(addr).filter(|conn| !conn.is_closed())
    }

    fn dial_gate(&self, addr: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut dials = self.inner.dials.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(dials.entry(addr.to_string()).or_default())
    }

    pub(crate) fn transport_config(&self) -> &TransportConfig {
        &self.inner.transport
    }

    pub(crate) fn intake(&self) -> mpsc::Sender<Channel> {
        self.inner.intake_tx.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakPeer {
        WeakPeer(Arc::downgrade(&self.inner))
    }

    /// Register `conn` and evict it once its session closes.
    pub(crate) fn track(&self, conn: PeerConnection) {
        let addr = conn.addr().to_string();
        if let Some(old) = self.inner.registry.insert(addr.clone(), conn.clone()) {
            if !old.same_connection(&conn) {
                debug!("duplex: replacing connection to {}", addr);
                old.disconnect();
            }
        }
        let registry = self.inner.registry.clone();
        tokio::spawn(async move {
            conn.closed().await;
            if registry.remove_if_same(&addr, &conn) {
                debug!("duplex: connection to {} ended", addr);
            }
        });
    }

    /// Drop a listener whose accept loop has stopped.
    pub(crate) fn forget_listener(&self, endpoint: &Endpoint) {
        let listener = self.lock_listeners().remove(&endpoint.to_string());
        if let Some(listener) = listener {
            listener.close();
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerListener>> {
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Refuse further channels and drop the ones already queued.
fn close_intake(intake: &mut mpsc::Receiver<Channel>) {
    intake.close();
    while let Ok(channel) = intake.try_recv() {
        debug!(service = %channel.service(), "Dropping queued channel");
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.inner.config.name)
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_defaults_pin_own_key() {
        let key = keys::generate();
        let config = DuplexConfig {
            name: "alice".to_string(),
            private_key: keys::signing_key_hex(&key),
            ..Default::default()
        };
        let peer_config = PeerConfig::from_config(&config).unwrap();
        assert_eq!(peer_config.name, "alice");
        assert_eq!(peer_config.signing_key.verifying_key(), key.verifying_key());
        assert!(peer_config
            .authorizer
            .authorize("bob", &key.verifying_key()));
        assert!(!peer_config
            .authorizer
            .authorize("bob", &keys::generate().verifying_key()));
    }

    #[test]
    fn test_from_config_allow_list() {
        let other = keys::generate();
        let config = DuplexConfig {
            authorized_keys: vec![keys::verifying_key_hex(&other.verifying_key())],
            greeting_timeout_secs: 2,
            ..Default::default()
        };
        let peer_config = PeerConfig::from_config(&config).unwrap();
        assert!(peer_config.authorizer.authorize("", &other.verifying_key()));
        assert_eq!(peer_config.greeting_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_from_config_bad_key() {
        let config = DuplexConfig {
            private_key: "zz".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            PeerConfig::from_config(&config),
            Err(WireError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_unbind_tcp() {
        let peer = Peer::new(PeerConfig::default());
        let bound = peer
            .bind(&"tcp://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(bound.to_string(), "tcp://127.0.0.1:0");
        assert_eq!(peer.listeners(), vec![bound.clone()]);

        peer.unbind(&bound).unwrap();
        assert!(peer.listeners().is_empty());
        assert!(matches!(peer.unbind(&bound), Err(WireError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_accept_returns_none_after_shutdown() {
        let peer = Peer::new(PeerConfig::default());
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.shutdown();
        assert!(waiter.await.unwrap().is_none());
        assert!(peer.intake().is_closed());
        assert!(peer.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_waiter_closes_intake() {
        let peer = Peer::new(PeerConfig::default());
        peer.shutdown();
        assert!(peer.intake().is_closed());
        assert!(peer.accept().await.is_none());
    }

    #[test]
    fn test_disconnect_unknown() {
        let peer = Peer::new(PeerConfig::default());
        assert!(matches!(
            peer.disconnect("tcp://127.0.0.1:1"),
            Err(WireError::NotFound(_))
        ));
    }
}
