//! Authorization policy for transport authentication.
//!
//! Both ends of a handshake ask an [`Authorizer`] whether the key the other
//! side proved possession of is acceptable. The default policy pins the
//! local key's own public half, which makes the key a shared identity.

use ed25519_dalek::VerifyingKey;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Decides whether an authenticated remote key may connect.
pub trait Authorizer: Send + Sync + 'static {
    /// `user` is the display name offered by a connecting client, or empty
    /// when a client checks a server's host key.
    fn authorize(&self, user: &str, key: &VerifyingKey) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str, &VerifyingKey) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, user: &str, key: &VerifyingKey) -> bool {
        self(user, key)
    }
}

/// Accepts exactly one key.
#[derive(Debug, Clone)]
pub struct PinnedKey(VerifyingKey);

impl PinnedKey {
    pub fn new(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl Authorizer for PinnedKey {
    fn authorize(&self, _user: &str, key: &VerifyingKey) -> bool {
        self.0.as_bytes().ct_eq(key.as_bytes()).into()
    }
}

/// Accepts any key from a fixed set.
#[derive(Debug, Clone, Default)]
pub struct AllowList(Vec<VerifyingKey>);

impl AllowList {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self(keys)
    }
}

impl Authorizer for AllowList {
    fn authorize(&self, _user: &str, key: &VerifyingKey) -> bool {
        self.0
            .iter()
            .any(|allowed| bool::from(allowed.as_bytes().ct_eq(key.as_bytes())))
    }
}

/// Shared handle to a policy.
pub type SharedAuthorizer = Arc<dyn Authorizer>;
