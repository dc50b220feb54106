//! Ed25519 key helpers.

use crate::error::WireError;
use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use sha2::{Digest, Sha256};

/// Generate a fresh random signing key.
pub fn generate() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Parse a hex-encoded 32-byte Ed25519 seed.
pub fn parse_signing_key(hex_seed: &str) -> Result<SigningKey, WireError> {
    let bytes = hex::decode(hex_seed.trim())
        .map_err(|e| WireError::InvalidKey(format!("private key is not hex: {e}")))?;
    let seed: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        WireError::InvalidKey(format!(
            "private key must be {SECRET_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, WireError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| WireError::InvalidKey(format!("public key is not hex: {e}")))?;
    let raw: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        WireError::InvalidKey(format!(
            "public key must be {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&raw).map_err(|e| WireError::InvalidKey(e.to_string()))
}

/// Hex encoding of a signing key's seed.
pub fn signing_key_hex(key: &SigningKey) -> String {
    hex::encode(key.to_bytes())
}

/// Hex encoding of a public key.
pub fn verifying_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_bytes())
}

/// Short SHA-256 fingerprint of a public key, for logs.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("SHA256:{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let key = generate();
        let parsed = parse_signing_key(&signing_key_hex(&key)).unwrap();
        assert_eq!(parsed.verifying_key(), key.verifying_key());

        let public = parse_verifying_key(&verifying_key_hex(&key.verifying_key())).unwrap();
        assert_eq!(public, key.verifying_key());
    }

    #[test]
    fn test_bad_keys_rejected() {
        assert!(matches!(
            parse_signing_key("not-hex"),
            Err(WireError::InvalidKey(_))
        ));
        assert!(matches!(
            parse_signing_key("abcd"),
            Err(WireError::InvalidKey(_))
        ));
        assert!(matches!(
            parse_verifying_key(&"00".repeat(31)),
            Err(WireError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = generate().verifying_key();
        assert_eq!(fingerprint(&key), fingerprint(&key));
        assert!(fingerprint(&key).starts_with("SHA256:"));
    }
}
