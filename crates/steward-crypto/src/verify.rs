//! Detached-signature verification for controller messages.
//!
//! Every command the agent accepts is authorized by a signature the
//! controller produced with its private key. Verification fails closed:
//! malformed keys or signatures of any length verify as false, never as
//! success, and never panic.

use ed25519_dalek::{Signature, VerifyingKey};

/// Length of an Ed25519 detached signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Verify `signature` over `message` against an Ed25519 verifying key.
///
/// Uses strict verification (rejects malleable encodings). Any decoding
/// failure is a verification failure.
pub fn verify_detached(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &sig).is_ok()
}
