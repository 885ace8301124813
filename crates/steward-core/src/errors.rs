//! Error types for the steward agent.
//!
//! Errors are grouped per concern and unified in [`CoreError`]. Every error
//! carries enough detail for local logs, while [`CoreError::public_message`]
//! maps it to the generic wording used on the wire and in rendered pages.
//! The split keeps authentication failures from acting as an oracle: a
//! forged signature and an unknown key name read identically to the remote
//! side.

use thiserror::Error;

use crate::actions::LegacyAction;
use crate::store::StoreError;
use steward_crypto::keys::KeyDecodeError;
use steward_fetch::FetchError;

// ============================================================================
// Authentication Errors
// ============================================================================

/// Failures while authenticating an inbound command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No trust relationship has been established yet
    #[error("agent is not paired")]
    NotPaired,

    /// Signature or keyed tag did not verify
    #[error("signature verification failed")]
    BadSignature,

    /// Token named a signing key that is not configured or no longer live
    #[error("unknown signing key {0:?}")]
    UnknownKey(String),

    /// Legacy message id at or below the stored counter
    #[error("replayed message id {id} (newest accepted {newest})")]
    ReplayedMessage { id: u64, newest: u64 },

    /// Nonce was already consumed by an earlier command
    #[error("nonce already used")]
    NonceAlreadyUsed,

    /// Principal lacks the manage capability
    #[error("principal may not manage this site")]
    Unauthorized,
}

// ============================================================================
// Pairing Errors
// ============================================================================

/// Failures of the one-time pairing handshake.
#[derive(Debug, Error)]
pub enum PairingError {
    /// A pairing record already exists; unpair first
    #[error("already paired")]
    AlreadyPaired,

    /// Bootstrap signature did not verify against the candidate key
    #[error("bootstrap signature verification failed")]
    BadSignature,

    /// Normal-mode pairing request without key material
    #[error("pairing request is missing the controller key")]
    MissingKey,

    /// Submitted controller key could not be decoded
    #[error("controller key rejected: {0}")]
    BadKeyMaterial(#[from] KeyDecodeError),

    /// Degraded pairing requested but not allowed by policy
    #[error("degraded pairing refused by policy")]
    DegradedNotAllowed,
}

// ============================================================================
// Unified Core Error
// ============================================================================

/// Unified error type for agent operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Authentication error
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Pairing error
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Storage error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Payload fetch error
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Sandbox collaborator reported a failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// Request body or parameters could not be decoded
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Action name outside the closed action set
    #[error("unknown action {0:?}")]
    UnknownAction(String),

    /// Action exists but is not served over this surface
    #[error("action {0:?} is not dispatchable")]
    NotDispatchable(LegacyAction),
}

impl CoreError {
    /// Wording used on the wire and in rendered pages.
    ///
    /// Authentication failures collapse to one generic message per
    /// category; the specific kind is only logged locally. Fetch failures
    /// are surfaced verbatim: the target was named by a signed command, so
    /// operator debugging outweighs secrecy there.
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Auth(auth_err) => match auth_err {
                AuthError::NotPaired => "agent is not paired".to_string(),
                AuthError::BadSignature => "permission denied".to_string(),
                AuthError::UnknownKey(_) => "permission denied".to_string(),
                AuthError::ReplayedMessage { .. } => "stale message id".to_string(),
                AuthError::NonceAlreadyUsed => "command already run".to_string(),
                AuthError::Unauthorized => "permission denied".to_string(),
            },
            CoreError::Pairing(pairing_err) => match pairing_err {
                PairingError::AlreadyPaired => "agent is already paired".to_string(),
                PairingError::BadSignature => {
                    "pairing request could not be verified".to_string()
                }
                PairingError::MissingKey => {
                    "pairing request is missing the controller key".to_string()
                }
                PairingError::BadKeyMaterial(_) => {
                    "controller key could not be decoded".to_string()
                }
                PairingError::DegradedNotAllowed => {
                    "degraded pairing is disabled on this agent".to_string()
                }
            },
            CoreError::Store(_) => "internal storage error".to_string(),
            CoreError::Fetch(fetch_err) => format!("fetch failed: {fetch_err}"),
            CoreError::Execution(detail) => format!("payload execution failed: {detail}"),
            CoreError::BadRequest(_) => "malformed request".to_string(),
            CoreError::UnknownAction(_) => "unknown action".to_string(),
            CoreError::NotDispatchable(_) => "unknown action".to_string(),
        }
    }

    /// Whether this error is an authentication outcome worth a `warn!`.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, CoreError::Auth(_) | CoreError::Pairing(_))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_and_bad_signature_read_identically() {
        let unknown = CoreError::Auth(AuthError::UnknownKey("rotated-2024".to_string()));
        let forged = CoreError::Auth(AuthError::BadSignature);
        assert_eq!(unknown.public_message(), forged.public_message());
    }

    #[test]
    fn test_unknown_key_name_not_exposed() {
        let err = CoreError::Auth(AuthError::UnknownKey("primary".to_string()));
        assert!(!err.public_message().contains("primary"));
    }

    #[test]
    fn test_replay_ids_not_exposed() {
        let err = CoreError::Auth(AuthError::ReplayedMessage { id: 41, newest: 97 });
        let public = err.public_message();
        assert!(!public.contains("41"));
        assert!(!public.contains("97"));
        // The internal rendering keeps both for the logs.
        assert!(err.to_string().contains("41"));
        assert!(err.to_string().contains("97"));
    }

    #[test]
    fn test_nonce_reuse_names_the_rerun() {
        let err = CoreError::Auth(AuthError::NonceAlreadyUsed);
        assert_eq!(err.public_message(), "command already run");
    }

    #[test]
    fn test_store_details_not_exposed() {
        let err = CoreError::Store(StoreError::OperationFailed(
            "sqlite table used_nonces is locked".to_string(),
        ));
        assert!(!err.public_message().contains("used_nonces"));
    }

    #[test]
    fn test_fetch_errors_surface_verbatim() {
        let err = CoreError::Fetch(FetchError::BadStatus {
            status: 404,
            reason: "Not Found".to_string(),
        });
        let public = err.public_message();
        assert!(public.contains("404"));
        assert!(public.starts_with("fetch failed:"));
    }

    #[test]
    fn test_unknown_action_name_not_exposed() {
        let err = CoreError::UnknownAction("drop_all_tables".to_string());
        assert_eq!(err.public_message(), "unknown action");
    }

    #[test]
    fn test_auth_failures_flagged_for_warn() {
        assert!(CoreError::Auth(AuthError::BadSignature).is_auth_failure());
        assert!(CoreError::Pairing(PairingError::AlreadyPaired).is_auth_failure());
        assert!(!CoreError::BadRequest("truncated".to_string()).is_auth_failure());
    }
}
