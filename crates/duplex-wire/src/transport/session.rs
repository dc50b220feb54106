//! Authenticated, multiplexed session over one byte stream.
//!
//! A [`Session`] owns two tasks: a writer that drains an ordered packet
//! queue onto the stream, and a reader that demultiplexes incoming packets
//! to channel streams, pending opens, pending replies and the [`Incoming`]
//! queues. Packets travel sealed with the keys agreed in the handshake, and
//! anything that fails to open or breaks the channel rules ends the session.
//! Closing the session (locally, or because the stream ended) aborts every
//! channel reader and fails every pending open and request.

use super::handshake::{self, RemoteIdentity};
use super::noise::{self, Cipher};
use super::packet::{decode_packet, encode_packet, Packet, CHANNEL_WINDOW, MAX_PACKET_SIZE};
use super::stream::{Inbound, InboundStream, NewChannel, Request, SendWindow, SubChannel};
use super::TransportConfig;
use crate::error::WireError;
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

struct ChannelSlot {
    data: Option<mpsc::UnboundedSender<Inbound>>,
    ext: Option<mpsc::UnboundedSender<Inbound>>,
    requests: mpsc::UnboundedSender<Request>,
    local_closed: Arc<AtomicBool>,
    send_window: Arc<SendWindow>,
    /// Bytes the remote may still send before we grant more.
    recv_window: u32,
    /// Bytes read locally and not yet granted back.
    unacked: u32,
}

/// State shared by the session handle, its tasks and its channels.
pub(crate) struct Shared {
    outbound: mpsc::UnboundedSender<Packet>,
    channels: Mutex<HashMap<u32, ChannelSlot>>,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<Result<(), WireError>>>>,
    pending_replies: Mutex<HashMap<u32, oneshot::Sender<(bool, Bytes)>>>,
    next_channel_id: AtomicU32,
    next_request_id: AtomicU32,
    /// Parity of the channel ids this side allocates (1 client, 0 server).
    local_parity: u32,
    closed: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolve once the session is closed.
    pub(crate) async fn closed(&self) {
        wait_closed(&mut self.closed.subscribe()).await
    }

    pub(crate) fn send(&self, packet: Packet) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        self.outbound
            .send(packet)
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Create the local end of channel `id`. Fails if the id is taken.
    pub(crate) fn register_channel(
        self: &Arc<Self>,
        id: u32,
    ) -> Result<(SubChannel, mpsc::UnboundedReceiver<Request>), WireError> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ext_tx, ext_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let local_closed = Arc::new(AtomicBool::new(false));
        let send_window = Arc::new(SendWindow::new(CHANNEL_WINDOW));
        {
            let mut channels = lock(&self.channels);
            if channels.contains_key(&id) {
                return Err(WireError::Protocol(format!("channel id {id} already in use")));
            }
            channels.insert(
                id,
                ChannelSlot {
                    data: Some(data_tx),
                    ext: Some(ext_tx),
                    requests: req_tx,
                    local_closed: Arc::clone(&local_closed),
                    send_window: Arc::clone(&send_window),
                    recv_window: CHANNEL_WINDOW,
                    unacked: 0,
                },
            );
        }
        let channel = SubChannel::new(
            id,
            Arc::clone(self),
            InboundStream::new(id, Arc::clone(self), data_rx),
            InboundStream::new(id, Arc::clone(self), ext_rx),
            send_window,
            local_closed,
        );
        // Teardown may have drained the table before the insert above.
        if self.is_closed() {
            channel.mark_closed();
            self.remove_channel(id);
            return Err(WireError::ConnectionClosed);
        }
        Ok((channel, req_rx))
    }

    pub(crate) fn remove_channel(&self, id: u32) {
        let slot = lock(&self.channels).remove(&id);
        if let Some(slot) = slot {
            slot.send_window.close();
        }
    }

    /// Credit `bytes` read by the application on channel `id`. Credit goes
    /// back to the sender in batches of half a window.
    pub(crate) fn release(&self, id: u32, bytes: usize) {
        let grant = {
            let mut channels = lock(&self.channels);
            let Some(slot) = channels.get_mut(&id) else {
                return;
            };
            slot.unacked = slot.unacked.saturating_add(bytes as u32);
            if slot.unacked < CHANNEL_WINDOW / 2 {
                return;
            }
            let grant = std::mem::take(&mut slot.unacked);
            slot.recv_window = slot.recv_window.saturating_add(grant);
            grant
        };
        let _ = self.send(Packet::WindowAdjust { id, bytes: grant });
    }

    pub(crate) async fn request(
        &self,
        channel: Option<u32>,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(bool, Bytes), WireError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let packet = match channel {
            Some(id) => Packet::ChannelRequest {
                id,
                request_id,
                name: name.to_string(),
                want_reply,
                payload,
            },
            None => Packet::Request {
                request_id,
                name: name.to_string(),
                want_reply,
                payload,
            },
        };
        if !want_reply {
            self.send(packet)?;
            return Ok((false, Bytes::new()));
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.pending_replies).insert(request_id, tx);
        if let Err(e) = self.send(packet) {
            lock(&self.pending_replies).remove(&request_id);
            return Err(e);
        }
        rx.await.map_err(|_| WireError::ConnectionClosed)
    }

    /// Hand incoming channel bytes to the matching reader, charging them
    /// against the channel's receive window.
    fn deliver(&self, id: u32, data: Bytes, extended: bool) -> Result<(), WireError> {
        let mut channels = lock(&self.channels);
        let Some(slot) = channels.get_mut(&id) else {
            trace!(channel = id, "Data for unknown channel");
            return Ok(());
        };
        let len = data.len() as u32;
        if len > slot.recv_window {
            return Err(WireError::Protocol(format!(
                "channel {id} overran its window by {} bytes",
                len - slot.recv_window
            )));
        }
        slot.recv_window -= len;
        let target = if extended { &slot.ext } else { &slot.data };
        if let Some(tx) = target {
            let _ = tx.send(Inbound::Data(data));
        }
        Ok(())
    }

    /// Route one packet. An error is a protocol violation that ends the
    /// session.
    fn dispatch(
        self: &Arc<Self>,
        packet: Packet,
        channels_tx: &mpsc::UnboundedSender<NewChannel>,
        requests_tx: &mpsc::UnboundedSender<Request>,
    ) -> Result<(), WireError> {
        match packet {
            Packet::ChannelOpen { id, kind, extra } => {
                let new = NewChannel::new(id, kind, extra, Arc::clone(self));
                if id % 2 == self.local_parity {
                    new.reject(
                        super::packet::RejectionReason::ConnectFailed,
                        "channel id belongs to the other side",
                    );
                    return Ok(());
                }
                if lock(&self.channels).contains_key(&id) {
                    new.reject(
                        super::packet::RejectionReason::ConnectFailed,
                        "duplicate channel id",
                    );
                    return Ok(());
                }
                // A closed intake hands the open back, and dropping it rejects.
                let _ = channels_tx.send(new);
            }
            Packet::ChannelOpenConfirm { id } => {
                if let Some(tx) = lock(&self.pending_opens).remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            Packet::ChannelOpenFailure {
                id,
                reason,
                message,
            } => {
                // Only our own pending opens can fail; other ids are ignored.
                let pending = lock(&self.pending_opens).remove(&id);
                if let Some(tx) = pending {
                    self.remove_channel(id);
                    let _ = tx.send(Err(WireError::ChannelRejected { reason, message }));
                }
            }
            Packet::Data { id, data } => self.deliver(id, data, false)?,
            Packet::ExtendedData { id, data } => self.deliver(id, data, true)?,
            Packet::WindowAdjust { id, bytes } => {
                if let Some(slot) = lock(&self.channels).get(&id) {
                    slot.send_window.grant(bytes);
                }
            }
            Packet::Eof { id } => {
                if let Some(slot) = lock(&self.channels).get_mut(&id) {
                    slot.data = None;
                    slot.ext = None;
                }
            }
            Packet::Close { id } => {
                let slot = lock(&self.channels).remove(&id);
                if let Some(slot) = slot {
                    slot.send_window.close();
                    if !slot.local_closed.swap(true, Ordering::AcqRel) {
                        let _ = self.send(Packet::Close { id });
                    }
                }
            }
            Packet::Request {
                request_id,
                name,
                want_reply,
                payload,
            } => {
                let request =
                    Request::new(request_id, name, want_reply, payload, self.outbound.clone());
                let _ = requests_tx.send(request);
            }
            Packet::ChannelRequest {
                id,
                request_id,
                name,
                want_reply,
                payload,
            } => {
                let request =
                    Request::new(request_id, name, want_reply, payload, self.outbound.clone());
                let target = lock(&self.channels).get(&id).map(|s| s.requests.clone());
                if let Some(tx) = target {
                    let _ = tx.send(request);
                }
            }
            Packet::Reply {
                request_id,
                ok,
                payload,
            } => {
                if let Some(tx) = lock(&self.pending_replies).remove(&request_id) {
                    let _ = tx.send((ok, payload));
                }
            }
        }
        Ok(())
    }

    fn teardown(&self) {
        let slots: Vec<ChannelSlot> = lock(&self.channels).drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.local_closed.store(true, Ordering::Release);
            slot.send_window.close();
            for tx in [slot.data, slot.ext].into_iter().flatten() {
                let _ = tx.send(Inbound::Aborted);
            }
        }
        lock(&self.pending_opens).clear();
        lock(&self.pending_replies).clear();
    }
}

/// Queues of unsolicited traffic from the remote side.
#[derive(Debug)]
pub struct Incoming {
    /// Channel-open requests.
    pub channels: mpsc::UnboundedReceiver<NewChannel>,
    /// Connection-level out-of-band requests.
    pub requests: mpsc::UnboundedReceiver<Request>,
}

/// Handle to an established session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    remote: Arc<RemoteIdentity>,
}

impl Session {
    /// Authenticate to a server as `user` and start multiplexing.
    pub async fn client<S>(
        mut stream: S,
        config: &TransportConfig,
        user: &str,
    ) -> Result<(Self, Incoming), WireError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (remote, cipher) = tokio::time::timeout(
            config.handshake_timeout,
            handshake::client(&mut stream, &config.signing_key, &*config.authorizer, user),
        )
        .await
        .map_err(|_| WireError::Timeout("handshake"))??;
        Ok(Self::start(stream, remote, cipher, 1))
    }

    /// Authenticate a connecting client and start multiplexing.
    pub async fn server<S>(
        mut stream: S,
        config: &TransportConfig,
    ) -> Result<(Self, Incoming), WireError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (remote, cipher) = tokio::time::timeout(
            config.handshake_timeout,
            handshake::server(&mut stream, &config.signing_key, &*config.authorizer),
        )
        .await
        .map_err(|_| WireError::Timeout("handshake"))??;
        Ok(Self::start(stream, remote, cipher, 2))
    }

    fn start<S>(
        stream: S,
        remote: RemoteIdentity,
        cipher: Cipher,
        first_channel_id: u32,
    ) -> (Self, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (channels_tx, channels_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU32::new(first_channel_id),
            next_request_id: AtomicU32::new(0),
            local_parity: first_channel_id % 2,
            closed,
        });

        tokio::spawn(write_loop(
            writer,
            cipher.clone(),
            outbound_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(read_loop(
            reader,
            cipher,
            Arc::clone(&shared),
            channels_tx,
            requests_tx,
        ));

        let session = Self {
            shared,
            remote: Arc::new(remote),
        };
        let incoming = Incoming {
            channels: channels_rx,
            requests: requests_rx,
        };
        (session, incoming)
    }

    /// Display name the remote client authenticated with (empty when the
    /// remote is the server).
    pub fn remote_user(&self) -> &str {
        &self.remote.user
    }

    /// Public key the remote side proved.
    pub fn remote_key(&self) -> &VerifyingKey {
        &self.remote.key
    }

    /// Open a sub-channel of type `kind`, waiting for the remote's answer.
    pub async fn open_channel(
        &self,
        kind: &str,
        extra: Bytes,
    ) -> Result<(SubChannel, mpsc::UnboundedReceiver<Request>), WireError> {
        let id = self.shared.next_channel_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending_opens).insert(id, tx);

        let (channel, requests) = match self.shared.register_channel(id) {
            Ok(pair) => pair,
            Err(e) => {
                lock(&self.shared.pending_opens).remove(&id);
                return Err(e);
            }
        };
        let open = Packet::ChannelOpen {
            id,
            kind: kind.to_string(),
            extra,
        };
        if let Err(e) = self.shared.send(open) {
            lock(&self.shared.pending_opens).remove(&id);
            channel.mark_closed();
            self.shared.remove_channel(id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok((channel, requests)),
            Ok(Err(e)) => {
                channel.mark_closed();
                Err(e)
            }
            Err(_) => {
                channel.mark_closed();
                Err(WireError::ConnectionClosed)
            }
        }
    }

    /// Send a connection-level out-of-band request. Without `want_reply`
    /// this returns `(false, empty)` as soon as the request is queued.
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(bool, Bytes), WireError> {
        self.shared.request(None, name, want_reply, payload).await
    }

    /// Close the session. Blocked channel readers are aborted and pending
    /// opens and requests fail with [`WireError::ConnectionClosed`].
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the session has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the session is closed by either side.
    pub async fn closed(&self) {
        self.shared.closed().await
    }

    pub(crate) fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_user", &self.remote.user)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolve once `closed` reads true. The borrow guard never outlives the call.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

async fn write_loop<W>(
    mut writer: W,
    cipher: Cipher,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.closed.subscribe();
    loop {
        tokio::select! {
            packet = outbound.recv() => {
                let Some(packet) = packet else { break };
                let result = match encode_packet(&packet) {
                    Ok(bytes) => {
                        noise::write_sealed(&mut writer, &cipher, &bytes, MAX_PACKET_SIZE).await
                    }
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    debug!(error = %e, "Session write failed");
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }
    shared.close();
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    mut reader: R,
    cipher: Cipher,
    shared: Arc<Shared>,
    channels_tx: mpsc::UnboundedSender<NewChannel>,
    requests_tx: mpsc::UnboundedSender<Request>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.closed.subscribe();
    loop {
        let result = tokio::select! {
            result = noise::read_sealed(&mut reader, &cipher, MAX_PACKET_SIZE) => result,
            _ = wait_closed(&mut closed) => break,
        };
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Session ended by remote");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Session read failed");
                break;
            }
        };
        let packet = match decode_packet(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Malformed packet, closing session");
                break;
            }
        };
        if let Err(e) = shared.dispatch(packet, &channels_tx, &requests_tx) {
            debug!(error = %e, "Closing session");
            break;
        }
    }
    shared.close();
    shared.teardown();
}
