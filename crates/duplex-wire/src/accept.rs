//! Accept loop: validates inbound channel-opens and feeds the intake queue.

use crate::channel::Channel;
use crate::message::{self, ChannelMeta, CHANNEL_TYPE, REJECT_EMPTY_SERVICE, REJECT_PARSE};
use crate::transport::{discard_requests, NewChannel, RejectionReason};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Opens from one connection that may wait for intake room at the same time.
pub(crate) const MAX_PENDING_OPENS: usize = 64;

/// Answer every channel-open arriving on one connection.
///
/// Unknown channel types are rejected inline. Duplex opens are each handled
/// on their own task so a slow intake never stalls the loop; past
/// [`MAX_PENDING_OPENS`] waiting tasks, further opens are refused.
pub(crate) async fn accept_channels(
    mut channels: mpsc::UnboundedReceiver<NewChannel>,
    intake: mpsc::Sender<Channel>,
    max_frame_size: usize,
    addr: String,
) {
    let pending = Arc::new(Semaphore::new(MAX_PENDING_OPENS));
    while let Some(new) = channels.recv().await {
        if new.kind() != CHANNEL_TYPE {
            debug!(peer = %addr, kind = %new.kind(), "Rejecting unknown channel type");
            let message = format!("unknown channel type: {}", new.kind());
            new.reject(RejectionReason::UnknownChannelType, &message);
            continue;
        }
        let Ok(slot) = Arc::clone(&pending).try_acquire_owned() else {
            debug!(peer = %addr, "Too many pending channel opens");
            new.reject(
                RejectionReason::ResourceShortage,
                "too many pending channel opens",
            );
            continue;
        };
        tokio::spawn(handle_open(
            new,
            intake.clone(),
            max_frame_size,
            addr.clone(),
            slot,
        ));
    }
    debug!(peer = %addr, "Channel accept loop ended");
}

async fn handle_open(
    new: NewChannel,
    intake: mpsc::Sender<Channel>,
    max_frame_size: usize,
    addr: String,
    _slot: OwnedSemaphorePermit,
) {
    let meta: ChannelMeta = match message::decode(new.extra_data()) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(peer = %addr, error = %e, "Rejecting undecodable channel metadata");
            new.reject(RejectionReason::UnknownChannelType, REJECT_PARSE);
            return;
        }
    };
    if meta.service.is_empty() {
        debug!(peer = %addr, "Rejecting channel with empty service");
        new.reject(RejectionReason::UnknownChannelType, REJECT_EMPTY_SERVICE);
        return;
    }

    // The open is confirmed only once the intake has room for it.
    let permit = tokio::select! {
        permit = intake.reserve() => permit,
        _ = new.closed() => {
            debug!(peer = %addr, service = %meta.service, "Connection closed, dropping open");
            return;
        }
    };
    let Ok(permit) = permit else {
        debug!(peer = %addr, service = %meta.service, "Intake closed, rejecting channel");
        new.reject(
            RejectionReason::ResourceShortage,
            "peer is not accepting channels",
        );
        return;
    };

    let (inner, requests) = match new.accept() {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!(peer = %addr, service = %meta.service, error = %e, "Channel accept failed");
            return;
        }
    };
    tokio::spawn(discard_requests(requests));
    permit.send(Channel::new(inner, meta, max_frame_size));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PinnedKey;
    use crate::error::WireError;
    use crate::frame::MAX_FRAME_SIZE;
    use crate::transport::{Session, TransportConfig};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    /// A client session whose opens land in an accept loop feeding the
    /// returned intake receiver.
    async fn setup(capacity: usize) -> (Session, mpsc::Receiver<Channel>) {
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
        let (server, server_in) = server.await.unwrap().unwrap();

        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(accept_channels(
            server_in.channels,
            tx,
            MAX_FRAME_SIZE,
            "test".to_string(),
        ));
        // The server session stays alive through its tasks.
        drop(server);
        (client, rx)
    }

    fn meta_bytes(service: &str, headers: &[&str]) -> Bytes {
        let meta = ChannelMeta::new(service, headers.iter().map(|h| h.to_string()).collect());
        Bytes::from(message::encode(&meta).unwrap())
    }

    fn rejection(result: Result<impl std::fmt::Debug, WireError>) -> (RejectionReason, String) {
        match result {
            Err(WireError::ChannelRejected { reason, message }) => (reason, message),
            other => panic!("Expected ChannelRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_valid_open_is_delivered() {
        let (client, mut intake) = setup(8).await;
        let (_ch, _reqs) = client
            .open_channel(CHANNEL_TYPE, meta_bytes("echo", &[]))
            .await
            .unwrap();
        let channel = intake.recv().await.unwrap();
        assert_eq!(channel.service(), "echo");
        assert!(channel.headers().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_metadata_rejected() {
        let (client, _intake) = setup(8).await;
        let (reason, message) = rejection(
            client
                .open_channel(CHANNEL_TYPE, Bytes::from_static(&[0xc1]))
                .await,
        );
        assert_eq!(reason, RejectionReason::UnknownChannelType);
        assert_eq!(message, REJECT_PARSE);
    }

    #[tokio::test]
    async fn test_empty_service_rejected() {
        let (client, _intake) = setup(8).await;
        let (reason, message) = rejection(
            client
                .open_channel(CHANNEL_TYPE, meta_bytes("", &["a"]))
                .await,
        );
        assert_eq!(reason, RejectionReason::UnknownChannelType);
        assert_eq!(message, REJECT_EMPTY_SERVICE);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (client, _intake) = setup(8).await;
        let (reason, message) = rejection(
            client
                .open_channel("session", meta_bytes("echo", &[]))
                .await,
        );
        assert_eq!(reason, RejectionReason::UnknownChannelType);
        assert_eq!(message, "unknown channel type: session");
    }

    #[tokio::test]
    async fn test_full_intake_holds_back_confirmation() {
        let (client, mut intake) = setup(1).await;
        let _a = client
            .open_channel(CHANNEL_TYPE, meta_bytes("a", &[]))
            .await
            .unwrap();
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .open_channel(CHANNEL_TYPE, meta_bytes("b", &[]))
                    .await
            })
        };

        // Rejections are still answered while "b" waits for room.
        let (_, message) = rejection(
            client
                .open_channel(CHANNEL_TYPE, meta_bytes("", &[]))
                .await,
        );
        assert_eq!(message, REJECT_EMPTY_SERVICE);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        assert_eq!(intake.recv().await.unwrap().service(), "a");
        let _b = waiting.await.unwrap().unwrap();
        assert_eq!(intake.recv().await.unwrap().service(), "b");
    }

    #[tokio::test]
    async fn test_closed_intake_rejects_waiting_opens() {
        let (client, mut intake) = setup(1).await;
        let _a = client
            .open_channel(CHANNEL_TYPE, meta_bytes("a", &[]))
            .await
            .unwrap();
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .open_channel(CHANNEL_TYPE, meta_bytes("b", &[]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        intake.close();
        let (reason, _) = rejection(waiting.await.unwrap());
        assert_eq!(reason, RejectionReason::ResourceShortage);
    }

    #[tokio::test]
    async fn test_pending_opens_are_capped() {
        let (client, _intake) = setup(1).await;
        let _a = client
            .open_channel(CHANNEL_TYPE, meta_bytes("a", &[]))
            .await
            .unwrap();

        let mut waiting = Vec::new();
        for i in 0..MAX_PENDING_OPENS {
            let client = client.clone();
            waiting.push(tokio::spawn(async move {
                client
                    .open_channel(CHANNEL_TYPE, meta_bytes(&format!("svc-{i}"), &[]))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (reason, message) = rejection(
            client
                .open_channel(CHANNEL_TYPE, meta_bytes("one-too-many", &[]))
                .await,
        );
        assert_eq!(reason, RejectionReason::ResourceShortage);
        assert_eq!(message, "too many pending channel opens");
        assert!(waiting.iter().all(|task| !task.is_finished()));
    }
}
