//! Noise encryption under every session.
//!
//! Both sides first run `Noise_NN_25519_ChaChaPoly_BLAKE2s`, which yields
//! fresh transport keys and a handshake hash. Every later frame is sealed
//! with those keys. The Ed25519 authentication that follows signs the
//! handshake hash, so the proven identities are bound to these keys.

use crate::error::WireError;
use crate::frame;
use snow::{HandshakeState, TransportState};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};

const NOISE_PARAMS: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";

/// Largest single Noise message, tag included.
pub const MAX_NOISE_MESSAGE: usize = 65535;

const TAG_LEN: usize = 16;
const MAX_NOISE_PAYLOAD: usize = MAX_NOISE_MESSAGE - TAG_LEN;

fn crypto(e: snow::Error) -> WireError {
    WireError::Crypto(e.to_string())
}

fn builder() -> Result<snow::Builder<'static>, WireError> {
    let params = NOISE_PARAMS.parse().map_err(crypto)?;
    Ok(snow::Builder::new(params))
}

/// Size of `plaintext` bytes once sealed.
pub fn sealed_len(plaintext: usize) -> usize {
    let messages = plaintext.div_ceil(MAX_NOISE_PAYLOAD).max(1);
    plaintext + messages * TAG_LEN
}

/// Transport keys of one session, shared by its reader and writer tasks.
#[derive(Clone)]
pub struct Cipher {
    state: Arc<Mutex<TransportState>>,
}

impl Cipher {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encrypt `plaintext` as a run of Noise messages. Every message except
    /// the last is full size, so [`open`](Self::open) can split the run
    /// without a length table.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let chunks: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(MAX_NOISE_PAYLOAD).collect()
        };
        let mut state = self.lock();
        let mut sealed = Vec::with_capacity(sealed_len(plaintext.len()));
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        for chunk in chunks {
            let len = state.write_message(chunk, &mut buf).map_err(crypto)?;
            sealed.extend_from_slice(&buf[..len]);
        }
        Ok(sealed)
    }

    /// Decrypt a run produced by the remote's [`seal`](Self::seal).
    ///
    /// Fails on anything not sealed with this session's keys, including
    /// replayed or reordered messages.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, WireError> {
        if sealed.is_empty() {
            return Err(WireError::Crypto("empty sealed frame".to_string()));
        }
        let mut state = self.lock();
        let mut plaintext = Vec::with_capacity(sealed.len());
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        for chunk in sealed.chunks(MAX_NOISE_MESSAGE) {
            let len = state.read_message(chunk, &mut buf).map_err(crypto)?;
            plaintext.extend_from_slice(&buf[..len]);
        }
        Ok(plaintext)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("params", &NOISE_PARAMS).finish()
    }
}

fn finish(noise: HandshakeState) -> Result<(Cipher, Vec<u8>), WireError> {
    let hash = noise.get_handshake_hash().to_vec();
    let transport = noise.into_transport_mode().map_err(crypto)?;
    let cipher = Cipher {
        state: Arc::new(Mutex::new(transport)),
    };
    Ok((cipher, hash))
}

/// Dialing side of the key exchange. Returns the keys and the handshake hash.
pub async fn initiate<S>(stream: &mut S) -> Result<(Cipher, Vec<u8>), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut noise = builder()?.build_initiator().map_err(crypto)?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let len = noise.write_message(&[], &mut buf).map_err(crypto)?;
    frame::write_frame(stream, &buf[..len], MAX_NOISE_MESSAGE).await?;
    let reply = frame::read_frame(stream, MAX_NOISE_MESSAGE).await?;
    noise.read_message(&reply, &mut buf).map_err(crypto)?;
    finish(noise)
}

/// Accepting side of the key exchange.
pub async fn respond<S>(stream: &mut S) -> Result<(Cipher, Vec<u8>), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut noise = builder()?.build_responder().map_err(crypto)?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let hello = frame::read_frame(stream, MAX_NOISE_MESSAGE).await?;
    noise.read_message(&hello, &mut buf).map_err(crypto)?;
    let len = noise.write_message(&[], &mut buf).map_err(crypto)?;
    frame::write_frame(stream, &buf[..len], MAX_NOISE_MESSAGE).await?;
    finish(noise)
}

/// Seal `plaintext` and write it as one frame.
pub async fn write_sealed<W>(
    writer: &mut W,
    cipher: &Cipher,
    plaintext: &[u8],
    max: usize,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if plaintext.len() > max {
        return Err(WireError::FrameTooLarge {
            size: plaintext.len(),
            max,
        });
    }
    let sealed = cipher.seal(plaintext)?;
    frame::write_frame(writer, &sealed, sealed_len(max)).await
}

/// Read one frame and open it.
pub async fn read_sealed<R>(
    reader: &mut R,
    cipher: &Cipher,
    max: usize,
) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let sealed = frame::read_frame(reader, sealed_len(max)).await?;
    cipher.open(&sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn keyed_pair() -> ((Cipher, Vec<u8>), (Cipher, Vec<u8>)) {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let responder = tokio::spawn(async move { respond(&mut b).await });
        let initiator = initiate(&mut a).await.unwrap();
        (initiator, responder.await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn test_both_sides_agree_on_handshake_hash() {
        let ((_, ours), (_, theirs)) = keyed_pair().await;
        assert!(!ours.is_empty());
        assert_eq!(ours, theirs);
    }

    #[tokio::test]
    async fn test_seal_and_open_across_message_boundaries() {
        let ((client, _), (server, _)) = keyed_pair().await;
        let sizes = [
            0,
            1,
            MAX_NOISE_PAYLOAD,
            MAX_NOISE_PAYLOAD + 1,
            3 * MAX_NOISE_PAYLOAD + 7,
        ];
        for size in sizes {
            let plaintext: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let sealed = client.seal(&plaintext).unwrap();
            assert_eq!(sealed.len(), sealed_len(size));
            assert_eq!(server.open(&sealed).unwrap(), plaintext);
        }
    }

    #[tokio::test]
    async fn test_tampered_and_plaintext_frames_fail() {
        let ((client, _), (server, _)) = keyed_pair().await;
        let mut sealed = client.seal(b"channel open").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(server.open(&sealed), Err(WireError::Crypto(_))));

        let (_, (fresh, _)) = keyed_pair().await;
        assert!(fresh.open(b"plain packet bytes, never sealed").is_err());
    }

    #[tokio::test]
    async fn test_replayed_message_fails() {
        let ((client, _), (server, _)) = keyed_pair().await;
        let sealed = client.seal(b"once").unwrap();
        assert_eq!(server.open(&sealed).unwrap(), b"once");
        assert!(server.open(&sealed).is_err());
    }
}
