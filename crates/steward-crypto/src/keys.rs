//! Controller verifying-key decoding.
//!
//! Signing keys reach the agent as configuration strings distributed by
//! the controller operator. Accepted encodings: SPKI PEM, standard
//! base64, or hex, all carrying a 32-byte Ed25519 public key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::VerifyingKey;

/// Length of a raw Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Error type for key decoding.
#[derive(Debug, thiserror::Error)]
pub enum KeyDecodeError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid pem block: {0}")]
    InvalidPem(String),
    #[error("not a valid ed25519 public key")]
    InvalidPublicKey,
    #[error("unrecognized key encoding")]
    UnrecognizedEncoding,
}

/// Decode a verifying key from raw 32-byte material.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, KeyDecodeError> {
    let arr: [u8; PUBLIC_KEY_LEN] =
        bytes
            .try_into()
            .map_err(|_| KeyDecodeError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                got: bytes.len(),
            })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyDecodeError::InvalidPublicKey)
}

/// Decode a verifying key from a configuration string.
///
/// A PEM armor is tried first; otherwise the string must be base64 or hex
/// of the raw key. A 64-character hex string is also valid base64, so the
/// base64 branch only claims the input when it yields exactly 32 bytes.
pub fn verifying_key_from_str(s: &str) -> Result<VerifyingKey, KeyDecodeError> {
    let s = s.trim();
    if s.contains("BEGIN PUBLIC KEY") {
        return VerifyingKey::from_public_key_pem(s)
            .map_err(|e| KeyDecodeError::InvalidPem(e.to_string()));
    }
    if let Ok(bytes) = BASE64.decode(s) {
        if bytes.len() == PUBLIC_KEY_LEN {
            return verifying_key_from_bytes(&bytes);
        }
    }
    if let Ok(bytes) = hex::decode(s) {
        if bytes.len() == PUBLIC_KEY_LEN {
            return verifying_key_from_bytes(&bytes);
        }
    }
    Err(KeyDecodeError::UnrecognizedEncoding)
}
