//! Pairing handshake between the agent and its remote controller.
//!
//! Pairing happens once, over the legacy surface, before any other command
//! is accepted. The controller proves possession of its signing key by
//! signing the bootstrap message; the agent persists the key and the
//! initial message counter in one pairing record. Re-pairing requires an
//! explicit unpair first, which is what stops a second party from quietly
//! replacing the trusted key.
//!
//! A degraded mode exists for controllers that cannot sign: the agent
//! generates a random seed, returns it once in the pairing response, and
//! authenticates later messages with a keyed hash. The mode is refused
//! unless configuration opts in.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use steward_crypto::keys;
use steward_crypto::secret::SharedSecret;
use steward_crypto::verify::verify_detached;

use crate::actions::LegacyAction;
use crate::errors::{AuthError, CoreError, PairingError};
use crate::store::{PairingRecord, StateStore, StoreError, TrustMaterial};
use crate::trust::KeyRing;
use crate::types::{unix_now, AgentSnapshot, AGENT_VERSION, PROTOCOL_VERSION, WILDCARD_CONTROLLER};

// ============================================================================
// Requests and Outcomes
// ============================================================================

/// Pairing policy taken from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairingPolicy {
    /// Allow the shared-secret fallback when the controller cannot sign
    pub allow_degraded: bool,
}

/// Decoded parameters of a pair request.
#[derive(Debug, Clone, Deserialize)]
pub struct PairRequest {
    /// Controller public key (PEM, base64, or hex); required unless degraded
    #[serde(default)]
    pub public_key: Option<String>,
    /// Request the shared-secret fallback instead of key trust
    #[serde(default)]
    pub degraded: bool,
}

/// Result of a successful pairing, returned to the controller.
#[derive(Debug, Serialize)]
pub struct PairOutcome {
    #[serde(flatten)]
    pub snapshot: AgentSnapshot,
    /// Fallback seed, base64. Present exactly once, in the degraded
    /// pairing response; the controller must store it to authenticate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_seed: Option<String>,
}

/// Read-only view of the agent's trust state for administrative UIs.
#[derive(Debug, Serialize)]
pub struct TrustReport {
    pub keys: Vec<KeyStatus>,
    pub pairing: Option<PairingStatus>,
}

#[derive(Debug, Serialize)]
pub struct KeyStatus {
    pub name: String,
    pub fingerprint: String,
    pub expires_at: Option<u64>,
    pub live: bool,
}

#[derive(Debug, Serialize)]
pub struct PairingStatus {
    pub controller: String,
    pub created_at: u64,
    pub last_used: Option<u64>,
    pub degraded: bool,
}

/// Message signed by the controller to bootstrap trust. It has the same
/// shape as every later legacy message: the pair action name immediately
/// followed by the decimal message id.
pub fn bootstrap_message(message_id: u64) -> Vec<u8> {
    crate::legacy::signed_message(LegacyAction::Pair.wire_name(), message_id)
}

// ============================================================================
// Pairing Service
// ============================================================================

/// Creates and destroys the trust relationship with the controller.
#[derive(Clone)]
pub struct PairingService {
    store: Arc<dyn StateStore>,
    policy: PairingPolicy,
    controller: String,
}

impl PairingService {
    /// Service for the single-tenant wildcard controller.
    pub fn new(store: Arc<dyn StateStore>, policy: PairingPolicy) -> Self {
        Self::for_controller(store, policy, WILDCARD_CONTROLLER)
    }

    /// Service bound to a specific controller identifier.
    pub fn for_controller(
        store: Arc<dyn StateStore>,
        policy: PairingPolicy,
        controller: impl Into<String>,
    ) -> Self {
        Self {
            store,
            policy,
            controller: controller.into(),
        }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Establish the pairing.
    ///
    /// Normal mode verifies `signature_b64` over the bootstrap message
    /// with the submitted key, then persists the key and the initial
    /// message counter. Degraded mode skips verification, generates a
    /// seed, and returns it in the outcome. Either way, creation is a
    /// compare-and-set: a concurrent second pairing sees `AlreadyPaired`.
    pub async fn pair(
        &self,
        request: &PairRequest,
        message_id: u64,
        signature_b64: &str,
    ) -> Result<PairOutcome, CoreError> {
        if request.degraded {
            if !self.policy.allow_degraded {
                return Err(PairingError::DegradedNotAllowed.into());
            }
            let secret = SharedSecret::generate();
            let seed_b64 = BASE64.encode(secret.seed());
            self.commit(TrustMaterial::DegradedSeed(*secret.seed()), message_id)
                .await?;
            warn!(
                controller = %self.controller,
                "paired in degraded mode; trust rests on a shared secret"
            );
            return Ok(PairOutcome {
                snapshot: self.snapshot_for(true, message_id),
                degraded_seed: Some(seed_b64),
            });
        }

        let material = request
            .public_key
            .as_deref()
            .ok_or(PairingError::MissingKey)?;
        let key = keys::verifying_key_from_str(material).map_err(PairingError::BadKeyMaterial)?;
        let signature = BASE64
            .decode(signature_b64)
            .map_err(|_| PairingError::BadSignature)?;
        let message = bootstrap_message(message_id);
        if !verify_detached(&key, &message, &signature) {
            return Err(PairingError::BadSignature.into());
        }

        self.commit(TrustMaterial::ControllerKey(key.to_bytes().to_vec()), message_id)
            .await?;
        info!(
            controller = %self.controller,
            id = message_id,
            "paired with controller key"
        );
        Ok(PairOutcome {
            snapshot: self.snapshot_for(false, message_id),
            degraded_seed: None,
        })
    }

    /// Delete the pairing record and whatever trust material it held.
    pub async fn unpair(&self) -> Result<(), CoreError> {
        self.store.delete_pairing(&self.controller).await?;
        info!(controller = %self.controller, "pairing removed");
        Ok(())
    }

    /// Whether a pairing record exists.
    pub async fn is_paired(&self) -> Result<bool, CoreError> {
        Ok(crate::store::is_paired(self.store.as_ref(), &self.controller).await?)
    }

    /// Current status snapshot; requires an established pairing.
    pub async fn snapshot(&self) -> Result<AgentSnapshot, CoreError> {
        let record = self
            .store
            .load_pairing(&self.controller)
            .await?
            .ok_or(AuthError::NotPaired)?;
        let counter = self.store.message_counter(&self.controller).await?;
        Ok(self.snapshot_for(record.trust.is_degraded(), counter))
    }

    /// Side-effect-free trust listing for the host's admin surface.
    pub async fn trust_report(&self, keyring: &KeyRing) -> Result<TrustReport, CoreError> {
        let now = unix_now();
        let keys = keyring
            .entries()
            .iter()
            .map(|entry| KeyStatus {
                name: entry.name.clone(),
                fingerprint: entry.fingerprint(),
                expires_at: entry.expires_at,
                live: entry.is_live(now),
            })
            .collect();
        let pairing = self
            .store
            .load_pairing(&self.controller)
            .await?
            .map(|record| PairingStatus {
                controller: record.controller,
                created_at: record.created_at,
                last_used: record.last_used,
                degraded: record.trust.is_degraded(),
            });
        Ok(TrustReport { keys, pairing })
    }

    async fn commit(&self, trust: TrustMaterial, message_id: u64) -> Result<(), CoreError> {
        let record = PairingRecord {
            controller: self.controller.clone(),
            trust,
            created_at: unix_now(),
            last_used: None,
        };
        match self.store.create_pairing(record).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(PairingError::AlreadyPaired.into());
            }
            Err(other) => return Err(other.into()),
        }
        self.store
            .set_message_counter(&self.controller, message_id)
            .await?;
        Ok(())
    }

    fn snapshot_for(&self, degraded: bool, message_counter: u64) -> AgentSnapshot {
        AgentSnapshot {
            agent_version: AGENT_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            degraded,
            message_counter,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
