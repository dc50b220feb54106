//! Channel: a framed, duplex byte pipe tagged with service metadata.
//!
//! A [`Channel`] wraps one transport sub-channel. It offers raw reads and
//! writes for protocols that frame themselves, frame-level reads and writes,
//! and an independent error sub-stream that is framed the same way. The
//! service name and headers are fixed when the channel is created.

use crate::error::WireError;
use crate::frame;
use crate::message::ChannelMeta;
use crate::transport::SubChannel;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub struct Channel {
    inner: SubChannel,
    meta: ChannelMeta,
    max_frame_size: usize,
}

impl Channel {
    pub(crate) fn new(inner: SubChannel, meta: ChannelMeta, max_frame_size: usize) -> Self {
        Self {
            inner,
            meta,
            max_frame_size,
        }
    }

    /// Service name the opener asked for.
    pub fn service(&self) -> &str {
        &self.meta.service
    }

    /// Headers sent with the open, in order.
    pub fn headers(&self) -> &[String] {
        &self.meta.headers
    }

    pub fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    /// Largest frame this channel reads or writes.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Raw read from the data stream. `Ok(0)` means the remote finished sending.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(&mut self.inner, buf).await
    }

    /// Raw write to the data stream.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AsyncWriteExt::write(&mut self.inner, buf).await
    }

    /// Send one length-prefixed frame on the data stream.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), WireError> {
        frame::write_frame(&mut self.inner, payload, self.max_frame_size).await
    }

    /// Read one frame from the data stream, waiting until it is complete.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, WireError> {
        frame::read_frame(&mut self.inner, self.max_frame_size).await
    }

    /// Send one frame on the error sub-stream.
    pub async fn write_error(&mut self, payload: &[u8]) -> Result<(), WireError> {
        if payload.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        self.inner
            .write_extended(&frame::encode_frame(payload))
            .await?;
        Ok(())
    }

    /// Read one frame from the error sub-stream.
    pub async fn read_error(&mut self) -> Result<Vec<u8>, WireError> {
        let max = self.max_frame_size;
        frame::read_frame(self.inner.extended_reader(), max).await
    }

    /// Half-close: no more data from this side, reads stay open.
    pub async fn close_write(&mut self) -> Result<(), WireError> {
        self.inner.close_write()
    }

    /// Close both directions. The remote's reads end after buffered data.
    pub async fn close(&mut self) -> Result<(), WireError> {
        self.inner.close()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("service", &self.meta.service)
            .field("headers", &self.meta.headers)
            .field("inner", &self.inner)
            .finish()
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PinnedKey;
    use crate::transport::{Session, TransportConfig};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    /// Open one sub-channel over an in-memory session and wrap both ends.
    async fn channel_pair(max_frame_size: usize) -> (Channel, Channel, Session, Session) {
        let key = crate::keys::generate();
        let config = TransportConfig {
            authorizer: Arc::new(PinnedKey::new(key.verifying_key())),
            signing_key: key,
            handshake_timeout: Duration::from_secs(5),
        };
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server_config = config.clone();
        let server = tokio::spawn(async move { Session::server(b, &server_config).await });
        let (client, _client_in) = Session::client(a, &config, "bob").await.unwrap();
        let (server, mut server_in) = server.await.unwrap().unwrap();

        let accept = tokio::spawn(async move {
            let new = server_in.channels.recv().await.unwrap();
            new.accept().unwrap().0
        });
        let (opened, _) = client.open_channel("@duplex", Bytes::new()).await.unwrap();
        let accepted = accept.await.unwrap();

        let meta = ChannelMeta::new("echo", vec!["v=1".to_string()]);
        (
            Channel::new(opened, meta.clone(), max_frame_size),
            Channel::new(accepted, meta, max_frame_size),
            client,
            server,
        )
    }

    #[tokio::test]
    async fn test_frames_and_metadata() {
        let (mut a, mut b, _c, _s) = channel_pair(frame::MAX_FRAME_SIZE).await;
        assert_eq!(a.service(), "echo");
        assert_eq!(b.headers(), &["v=1".to_string()]);

        a.write_frame(b"ping").await.unwrap();
        a.write_frame(b"").await.unwrap();
        assert_eq!(b.read_frame().await.unwrap(), b"ping");
        assert!(b.read_frame().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_stream_is_independent() {
        let (mut a, mut b, _c, _s) = channel_pair(frame::MAX_FRAME_SIZE).await;
        a.write_frame(b"data").await.unwrap();
        a.write_error(b"bad request").await.unwrap();

        // The error frame is readable before the pending data frame.
        assert_eq!(b.read_error().await.unwrap(), b"bad request");
        assert_eq!(b.read_frame().await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_half_close_keeps_reads_open() {
        let (mut a, mut b, _c, _s) = channel_pair(frame::MAX_FRAME_SIZE).await;
        a.write(b"last words").await.unwrap();
        a.close_write().await.unwrap();

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        b.write_frame(b"reply").await.unwrap();
        assert_eq!(a.read_frame().await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn test_frame_limit_enforced() {
        let (mut a, _b, _c, _s) = channel_pair(16).await;
        assert!(matches!(
            a.write_frame(&[0u8; 17]).await,
            Err(WireError::FrameTooLarge { size: 17, max: 16 })
        ));
        assert!(matches!(
            a.write_error(&[0u8; 17]).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_ends_remote_reads() {
        let (mut a, mut b, _c, _s) = channel_pair(frame::MAX_FRAME_SIZE).await;
        a.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        match b.read_frame().await {
            Err(WireError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected Io(UnexpectedEof), got {other:?}"),
        }
    }
}
