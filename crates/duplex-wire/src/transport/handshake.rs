//! Mutual Ed25519 authentication performed before multiplexing starts.
//!
//! ```text
//! client                                 server
//!   Noise NN: e                    ->
//!                                  <-    Noise NN: e, ee
//!   ClientHello { nonce_c }        ->
//!                                  <-    ServerHello { host_key, nonce_s, sig }
//!   ClientAuth { user, key, sig }  ->
//!                                  <-    AuthResult { accepted, reason }
//! ```
//!
//! The key exchange runs first and everything after it is sealed. The server
//! signs the Noise handshake hash and both nonces with its host key; the
//! client signs the same plus its user name with its own key. Each side then
//! asks its [`Authorizer`] about the other's key.

use super::noise::{self, Cipher};
use crate::auth::Authorizer;
use crate::error::WireError;
use crate::keys;
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Handshake protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

const MAX_HANDSHAKE_FRAME: usize = 4096;
const HOST_CONTEXT: &[u8] = b"duplex-host-v2";
const USER_CONTEXT: &[u8] = b"duplex-user-v2";

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    ClientHello {
        version: u32,
        nonce: [u8; 32],
    },
    ServerHello {
        version: u32,
        host_key: [u8; 32],
        nonce: [u8; 32],
        signature: Bytes,
    },
    ClientAuth {
        user: String,
        public_key: [u8; 32],
        signature: Bytes,
    },
    AuthResult {
        accepted: bool,
        reason: String,
    },
}

/// The identity the remote side proved.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    /// Display name offered by the client; empty for a server.
    pub user: String,
    pub key: VerifyingKey,
}

/// Signed by the server: context, handshake hash, both nonces, host key.
fn host_transcript(
    hash: &[u8],
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
    host_key: &[u8; 32],
) -> Vec<u8> {
    let mut t = Vec::with_capacity(HOST_CONTEXT.len() + hash.len() + 96);
    t.extend_from_slice(HOST_CONTEXT);
    t.extend_from_slice(hash);
    t.extend_from_slice(client_nonce);
    t.extend_from_slice(server_nonce);
    t.extend_from_slice(host_key);
    t
}

/// Signed by the client: context, handshake hash, both nonces, user, key.
fn user_transcript(
    hash: &[u8],
    server_nonce: &[u8; 32],
    client_nonce: &[u8; 32],
    user: &str,
    public_key: &[u8; 32],
) -> Vec<u8> {
    let mut t = Vec::with_capacity(USER_CONTEXT.len() + hash.len() + 96 + user.len());
    t.extend_from_slice(USER_CONTEXT);
    t.extend_from_slice(hash);
    t.extend_from_slice(server_nonce);
    t.extend_from_slice(client_nonce);
    t.extend_from_slice(user.as_bytes());
    t.extend_from_slice(public_key);
    t
}

fn verify(key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<VerifyingKey, WireError> {
    let key = VerifyingKey::from_bytes(key)
        .map_err(|e| WireError::HandshakeFailed(format!("invalid public key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| WireError::HandshakeFailed(format!("invalid signature: {e}")))?;
    key.verify(message, &signature)
        .map_err(|_| WireError::Unauthorized("signature verification failed".into()))?;
    Ok(key)
}

async fn send<S>(stream: &mut S, cipher: &Cipher, msg: &Handshake) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    let bytes = rmp_serde::to_vec(msg)?;
    noise::write_sealed(stream, cipher, &bytes, MAX_HANDSHAKE_FRAME).await
}

async fn recv<S>(stream: &mut S, cipher: &Cipher) -> Result<Handshake, WireError>
where
    S: AsyncRead + Unpin,
{
    let bytes = noise::read_sealed(stream, cipher, MAX_HANDSHAKE_FRAME).await?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// Client side: authenticate as `user` and check the server's host key.
///
/// Returns the proven server identity and the session keys.
pub async fn client<S>(
    stream: &mut S,
    key: &SigningKey,
    authorizer: &dyn Authorizer,
    user: &str,
) -> Result<(RemoteIdentity, Cipher), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (cipher, hash) = noise::initiate(stream).await?;
    let client_nonce: [u8; 32] = rand::random();
    send(
        stream,
        &cipher,
        &Handshake::ClientHello {
            version: PROTOCOL_VERSION,
            nonce: client_nonce,
        },
    )
    .await?;

    let (host_key, server_nonce) = match recv(stream, &cipher).await? {
        Handshake::ServerHello {
            version,
            host_key,
            nonce,
            signature,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(WireError::HandshakeFailed(format!(
                    "protocol version mismatch: local={PROTOCOL_VERSION}, remote={version}"
                )));
            }
            let transcript = host_transcript(&hash, &client_nonce, &nonce, &host_key);
            (verify(&host_key, &transcript, &signature)?, nonce)
        }
        other => {
            return Err(WireError::HandshakeFailed(format!(
                "expected ServerHello, got {other:?}"
            )))
        }
    };

    if !authorizer.authorize("", &host_key) {
        warn!(host_key = %keys::fingerprint(&host_key), "Host key not authorized");
        return Err(WireError::Unauthorized(format!(
            "host key {} not authorized",
            keys::fingerprint(&host_key)
        )));
    }

    let public_key = key.verifying_key().to_bytes();
    let transcript = user_transcript(&hash, &server_nonce, &client_nonce, user, &public_key);
    send(
        stream,
        &cipher,
        &Handshake::ClientAuth {
            user: user.to_string(),
            public_key,
            signature: Bytes::copy_from_slice(&key.sign(&transcript).to_bytes()),
        },
    )
    .await?;

    match recv(stream, &cipher).await? {
        Handshake::AuthResult { accepted: true, .. } => {
            debug!(host_key = %keys::fingerprint(&host_key), "Authenticated to server");
            let remote = RemoteIdentity {
                user: String::new(),
                key: host_key,
            };
            Ok((remote, cipher))
        }
        Handshake::AuthResult { reason, .. } => Err(WireError::Unauthorized(reason)),
        other => Err(WireError::HandshakeFailed(format!(
            "expected AuthResult, got {other:?}"
        ))),
    }
}

/// Server side: prove the host key and authenticate the client.
pub async fn server<S>(
    stream: &mut S,
    key: &SigningKey,
    authorizer: &dyn Authorizer,
) -> Result<(RemoteIdentity, Cipher), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (cipher, hash) = noise::respond(stream).await?;
    let client_nonce = match recv(stream, &cipher).await? {
        Handshake::ClientHello { version, nonce } if version == PROTOCOL_VERSION => nonce,
        Handshake::ClientHello { version, .. } => {
            send(
                stream,
                &cipher,
                &Handshake::AuthResult {
                    accepted: false,
                    reason: format!("protocol version mismatch: expected {PROTOCOL_VERSION}"),
                },
            )
            .await?;
            return Err(WireError::HandshakeFailed(format!(
                "protocol version mismatch: local={PROTOCOL_VERSION}, remote={version}"
            )));
        }
        other => {
            return Err(WireError::HandshakeFailed(format!(
                "expected ClientHello, got {other:?}"
            )))
        }
    };

    let server_nonce: [u8; 32] = rand::random();
    let host_key = key.verifying_key().to_bytes();
    let transcript = host_transcript(&hash, &client_nonce, &server_nonce, &host_key);
    send(
        stream,
        &cipher,
        &Handshake::ServerHello {
            version: PROTOCOL_VERSION,
            host_key,
            nonce: server_nonce,
            signature: Bytes::copy_from_slice(&key.sign(&transcript).to_bytes()),
        },
    )
    .await?;

    let (user, public_key, signature) = match recv(stream, &cipher).await? {
        Handshake::ClientAuth {
            user,
            public_key,
            signature,
        } => (user, public_key, signature),
        other => {
            return Err(WireError::HandshakeFailed(format!(
                "expected ClientAuth, got {other:?}"
            )))
        }
    };

    let transcript = user_transcript(&hash, &server_nonce, &client_nonce, &user, &public_key);
    let verdict = verify(&public_key, &transcript, &signature).and_then(|client_key| {
        if authorizer.authorize(&user, &client_key) {
            Ok(client_key)
        } else {
            Err(WireError::Unauthorized(format!(
                "key {} not authorized",
                keys::fingerprint(&client_key)
            )))
        }
    });

    match verdict {
        Ok(client_key) => {
            send(
                stream,
                &cipher,
                &Handshake::AuthResult {
                    accepted: true,
                    reason: String::new(),
                },
            )
            .await?;
            let remote = RemoteIdentity {
                user,
                key: client_key,
            };
            Ok((remote, cipher))
        }
        Err(e) => {
            warn!(user = %user, error = %e, "Rejected client authentication");
            send(
                stream,
                &cipher,
                &Handshake::AuthResult {
                    accepted: false,
                    reason: "unauthorized".to_string(),
                },
            )
            .await?;
            Err(e)
        }
    }
}
