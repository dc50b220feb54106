//! Sub-channel byte streams and out-of-band requests.

use super::packet::{Packet, RejectionReason, MAX_DATA_CHUNK};
use super::session::Shared;
use crate::error::WireError;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// What the demultiplexer hands to a stream reader.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    /// The session went away under the reader.
    Aborted,
}

/// Read side of one sub-stream (data or error) of a sub-channel.
///
/// Reports EOF once the remote sent EOF or closed the channel, and a
/// `ConnectionAborted` error if the whole session was torn down. Bytes
/// handed to the caller are credited back to the sender.
pub struct InboundStream {
    id: u32,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    pending: Bytes,
}

impl InboundStream {
    pub(crate) fn new(id: u32, shared: Arc<Shared>, rx: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self {
            id,
            shared,
            rx,
            pending: Bytes::new(),
        }
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("id", &self.id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl AsyncRead for InboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                this.shared.release(this.id, n);
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Inbound::Data(data)) => this.pending = data,
                Some(Inbound::Aborted) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "transport closed",
                    )))
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

#[derive(Debug)]
struct WindowState {
    credit: u32,
    closed: bool,
    waker: Option<Waker>,
}

/// Send credit the remote has granted on one channel.
#[derive(Debug)]
pub(crate) struct SendWindow {
    state: Mutex<WindowState>,
}

impl SendWindow {
    pub(crate) fn new(credit: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                credit,
                closed: false,
                waker: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add credit and wake a writer waiting for it.
    pub(crate) fn grant(&self, bytes: u32) {
        let waker = {
            let mut state = self.lock();
            state.credit = state.credit.saturating_add(bytes);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// No more credit will come. Wakes a waiting writer.
    pub(crate) fn close(&self) {
        let waker = {
            let mut state = self.lock();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Take up to `want` bytes of credit. `None` once the window is closed.
    fn poll_take(&self, cx: &mut Context<'_>, want: usize) -> Poll<Option<usize>> {
        let mut state = self.lock();
        if state.closed {
            return Poll::Ready(None);
        }
        if state.credit == 0 {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = want.min(state.credit as usize);
        state.credit -= n as u32;
        Poll::Ready(Some(n))
    }
}

/// One multiplexed sub-channel: an ordered byte stream plus an error
/// sub-stream, with half-close.
///
/// Writes wait while the remote has granted no credit, so a reader that
/// stops reading holds back its writer. Dropping a sub-channel closes it.
pub struct SubChannel {
    id: u32,
    shared: Arc<Shared>,
    data: InboundStream,
    ext: InboundStream,
    window: Arc<SendWindow>,
    eof_sent: bool,
    local_closed: Arc<AtomicBool>,
}

impl SubChannel {
    pub(crate) fn new(
        id: u32,
        shared: Arc<Shared>,
        data: InboundStream,
        ext: InboundStream,
        window: Arc<SendWindow>,
        local_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            shared,
            data,
            ext,
            window,
            eof_sent: false,
            local_closed,
        }
    }

    /// Channel id on this session.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn closed_error(&self) -> io::Error {
        if self.shared.is_closed() {
            io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed")
        } else {
            io::Error::new(io::ErrorKind::BrokenPipe, "channel closed for writing")
        }
    }

    /// Send as much of `buf` as the window allows, at most one packet.
    fn poll_send(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        extended: bool,
    ) -> Poll<io::Result<usize>> {
        if self.eof_sent || self.local_closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(self.closed_error()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let want = buf.len().min(MAX_DATA_CHUNK);
        let n = match ready!(self.window.poll_take(cx, want)) {
            Some(n) => n,
            None => return Poll::Ready(Err(self.closed_error())),
        };
        let data = Bytes::copy_from_slice(&buf[..n]);
        let packet = if extended {
            Packet::ExtendedData { id: self.id, data }
        } else {
            Packet::Data { id: self.id, data }
        };
        self.shared
            .send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed"))?;
        Poll::Ready(Ok(n))
    }

    /// Write all of `buf` to the error sub-stream.
    pub async fn write_extended(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let rest = &buf[written..];
            let n = std::future::poll_fn(|cx| self.poll_send(cx, rest, true)).await?;
            written += n;
        }
        Ok(())
    }

    /// Reader for the error sub-stream.
    pub fn extended_reader(&mut self) -> &mut InboundStream {
        &mut self.ext
    }

    /// Signal that no more data follows. Reads stay open.
    pub fn close_write(&mut self) -> Result<(), WireError> {
        if self.eof_sent || self.local_closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.eof_sent = true;
        self.shared.send(Packet::Eof { id: self.id })
    }

    /// Close both directions.
    pub fn close(&mut self) -> Result<(), WireError> {
        if self.local_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.send(Packet::Close { id: self.id })
    }

    /// Send an out-of-band request scoped to this channel.
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(bool, Bytes), WireError> {
        self.shared
            .request(Some(self.id), name, want_reply, payload)
            .await
    }

    /// Forget the channel without telling the remote (it never opened).
    pub(crate) fn mark_closed(&self) {
        self.local_closed.store(true, Ordering::Release);
    }
}

impl Drop for SubChannel {
    fn drop(&mut self) {
        if !self.local_closed.swap(true, Ordering::AcqRel) {
            let _ = self.shared.send(Packet::Close { id: self.id });
        }
    }
}

impl std::fmt::Debug for SubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubChannel")
            .field("id", &self.id)
            .field("eof_sent", &self.eof_sent)
            .field("closed", &self.local_closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl AsyncRead for SubChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_read(cx, buf)
    }
}

impl AsyncWrite for SubChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_send(cx, buf, false)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(
            self.get_mut()
                .close_write()
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
        )
    }
}

/// An out-of-band request received from the remote.
///
/// Dropping a request that wants a reply answers it negatively.
#[derive(Debug)]
pub struct Request {
    name: String,
    want_reply: bool,
    payload: Bytes,
    responder: Option<(u32, mpsc::UnboundedSender<Packet>)>,
}

impl Request {
    pub(crate) fn new(
        request_id: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
        outbound: mpsc::UnboundedSender<Packet>,
    ) -> Self {
        Self {
            name,
            want_reply,
            payload,
            responder: Some((request_id, outbound)),
        }
    }

    /// Request name, e.g. `keepalive@duplex`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Answer the request. A no-op if the sender did not ask for a reply.
    pub fn reply(mut self, ok: bool, payload: Bytes) {
        self.respond(ok, payload);
    }

    fn respond(&mut self, ok: bool, payload: Bytes) {
        if let Some((request_id, outbound)) = self.responder.take() {
            if self.want_reply {
                let _ = outbound.send(Packet::Reply {
                    request_id,
                    ok,
                    payload,
                });
            }
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.respond(false, Bytes::new());
    }
}

/// Answer every request on `requests` negatively until the stream ends.
pub async fn discard_requests(mut requests: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = requests.recv().await {
        request.reply(false, Bytes::new());
    }
}

/// An inbound channel-open awaiting a decision.
///
/// Dropping it without calling [`accept`](Self::accept) or
/// [`reject`](Self::reject) rejects it, so the opener never hangs.
pub struct NewChannel {
    id: u32,
    kind: String,
    extra: Bytes,
    shared: Arc<Shared>,
    answered: bool,
}

impl NewChannel {
    pub(crate) fn new(id: u32, kind: String, extra: Bytes, shared: Arc<Shared>) -> Self {
        Self {
            id,
            kind,
            extra,
            shared,
            answered: false,
        }
    }

    /// Channel type requested by the opener.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Opaque open metadata.
    pub fn extra_data(&self) -> &[u8] {
        &self.extra
    }

    /// Resolve once the session carrying this open is closed.
    pub async fn closed(&self) {
        self.shared.closed().await
    }

    /// Confirm the open. If the id cannot be registered the open is
    /// rejected as it is dropped.
    pub fn accept(mut self) -> Result<(SubChannel, mpsc::UnboundedReceiver<Request>), WireError> {
        let (channel, requests) = self.shared.register_channel(self.id)?;
        self.answered = true;
        if let Err(e) = self.shared.send(Packet::ChannelOpenConfirm { id: self.id }) {
            channel.mark_closed();
            self.shared.remove_channel(self.id);
            return Err(e);
        }
        Ok((channel, requests))
    }

    /// Refuse the open with `reason` and a human-readable `message`.
    pub fn reject(mut self, reason: RejectionReason, message: &str) {
        self.answered = true;
        let _ = self.shared.send(Packet::ChannelOpenFailure {
            id: self.id,
            reason,
            message: message.to_string(),
        });
    }
}

impl Drop for NewChannel {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.shared.send(Packet::ChannelOpenFailure {
                id: self.id,
                reason: RejectionReason::ConnectFailed,
                message: "channel open was not handled".to_string(),
            });
        }
    }
}

impl std::fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewChannel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("extra_len", &self.extra.len())
            .finish()
    }
}
