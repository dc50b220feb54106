//! Bundled transport provider.
//!
//! Supplies what the duplex protocol needs from a transport: mutual
//! authentication by public key, ordered and flow-controlled byte streams
//! per opened sub-channel, an out-of-band request/response side-channel, and
//! channel rejection with a reason. It runs over any ordered byte stream and
//! seals all traffic with Noise keys bound to the authenticated identities.

pub mod handshake;
pub mod noise;
pub mod packet;
pub mod session;
pub mod stream;

pub use noise::Cipher;
pub use packet::{RejectionReason, CHANNEL_WINDOW};
pub use session::{Incoming, Session};
pub use stream::{discard_requests, InboundStream, NewChannel, Request, SubChannel};

use crate::auth::SharedAuthorizer;
use ed25519_dalek::SigningKey;
use std::time::Duration;

/// Default bound on the authentication exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity and policy used for every session.
#[derive(Clone)]
pub struct TransportConfig {
    /// Local key: host key when accepting, user key when dialing.
    pub signing_key: SigningKey,
    /// Decides which remote keys are acceptable.
    pub authorizer: SharedAuthorizer,
    /// Bound on key exchange plus authentication.
    pub handshake_timeout: Duration,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field(
                "public_key",
                &crate::keys::fingerprint(&self.signing_key.verifying_key()),
            )
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}
