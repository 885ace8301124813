//! Legacy command surface: envelope codec, message authenticator, and
//! the dispatcher that routes actions to host capabilities.
//!
//! Controllers POST a base64 JSON envelope carrying an action name, a
//! monotonically increasing message id, a detached signature, and free
//! parameters. The dispatcher decodes, rejects unknown actions before
//! any authentication work, authenticates against the pairing record,
//! and routes to the bound handler. Every outcome is an encoded
//! response body; the transport never answers with a bare error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use steward_crypto::keys;
use steward_crypto::secret::SharedSecret;
use steward_crypto::verify::verify_detached;

use crate::actions::{ActionRegistry, LegacyAction};
use crate::errors::{AuthError, CoreError};
use crate::pairing::{PairRequest, PairingService};
use crate::store::{StateStore, StoreError, TrustMaterial};
use crate::types::{unix_now, WILDCARD_CONTROLLER};

// ============================================================================
// Wire Codec
// ============================================================================

/// Decoded legacy request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyEnvelope {
    /// Action name as sent on the wire
    pub action: String,
    /// Message id; must exceed the stored counter
    pub id: u64,
    /// Detached signature over the signed message, base64
    pub signature: String,
    /// Free-form action parameters
    #[serde(default)]
    pub params: Value,
}

/// Decode a request body: base64 around a JSON envelope.
pub fn decode_envelope(body: &str) -> Result<LegacyEnvelope, CoreError> {
    let raw = BASE64
        .decode(body.trim())
        .map_err(|_| CoreError::BadRequest("body is not base64".to_string()))?;
    serde_json::from_slice(&raw)
        .map_err(|_| CoreError::BadRequest("body is not a command envelope".to_string()))
}

/// Encode a success response: base64 around `{"success": value}`.
pub fn encode_success(value: &Value) -> String {
    BASE64.encode(json!({ "success": value }).to_string())
}

/// Encode an error response: base64 around `{"error": message}`.
pub fn encode_error(message: &str) -> String {
    BASE64.encode(json!({ "error": message }).to_string())
}

/// Byte sequence the controller signs for a legacy message: the action
/// name immediately followed by the decimal message id, with nothing in
/// between. `("a1", 2)` and `("a", 12)` therefore sign identical bytes;
/// deployed controllers depend on this exact concatenation and the
/// message counter is what disambiguates messages in practice.
pub fn signed_message(action: &str, id: u64) -> Vec<u8> {
    format!("{action}{id}").into_bytes()
}

// ============================================================================
// Message Authenticator
// ============================================================================

/// Authenticates legacy messages against the pairing record.
pub struct LegacyAuthenticator {
    store: Arc<dyn StateStore>,
    controller: String,
}

impl LegacyAuthenticator {
    /// Authenticator for the single-tenant wildcard controller.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::for_controller(store, WILDCARD_CONTROLLER)
    }

    /// Authenticator bound to a specific controller identifier.
    pub fn for_controller(store: Arc<dyn StateStore>, controller: impl Into<String>) -> Self {
        Self {
            store,
            controller: controller.into(),
        }
    }

    /// Authenticate one legacy message.
    ///
    /// The order is fixed: pairing lookup, signature verification, then
    /// the replay check. The replay check and the counter advance are a
    /// single store operation, so two racing copies of the same message
    /// cannot both pass. A message id is accepted only if it is strictly
    /// greater than the stored counter.
    ///
    /// # Errors
    ///
    /// * [`AuthError::NotPaired`] when no pairing record exists
    /// * [`AuthError::BadSignature`] when the signature does not verify
    /// * [`AuthError::ReplayedMessage`] when the id does not advance
    pub async fn authenticate(
        &self,
        action: &str,
        id: u64,
        signature_b64: &str,
    ) -> Result<(), CoreError> {
        let record = self
            .store
            .load_pairing(&self.controller)
            .await?
            .ok_or(AuthError::NotPaired)?;

        let signature = BASE64
            .decode(signature_b64)
            .map_err(|_| AuthError::BadSignature)?;
        let message = signed_message(action, id);

        // Key bytes were validated at pairing time; a corrupt record
        // simply fails verification.
        let verified = match &record.trust {
            TrustMaterial::ControllerKey(bytes) => match keys::verifying_key_from_bytes(bytes) {
                Ok(key) => verify_detached(&key, &message, &signature),
                Err(_) => false,
            },
            TrustMaterial::DegradedSeed(seed) => {
                SharedSecret::from_seed(*seed).verify(&message, &signature)
            }
        };
        if !verified {
            warn!(action, id, "legacy message failed signature verification");
            return Err(AuthError::BadSignature.into());
        }

        if !self
            .store
            .advance_message_counter(&self.controller, id)
            .await?
        {
            let newest = self.store.message_counter(&self.controller).await?;
            warn!(action, id, newest, "legacy message replayed or out of order");
            return Err(AuthError::ReplayedMessage { id, newest }.into());
        }

        match self.store.touch_pairing(&self.controller, unix_now()).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(AuthError::NotPaired.into()),
            Err(other) => return Err(other.into()),
        }

        debug!(action, id, "legacy message authenticated");
        Ok(())
    }
}

// ============================================================================
// Dispatch Statistics
// ============================================================================

/// Counters for legacy dispatch outcomes.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Requests received
    pub received: AtomicU64,
    /// Requests served by a handler or lifecycle action
    pub dispatched: AtomicU64,
    /// Requests refused for any reason
    pub rejected: AtomicU64,
    /// Refusals from authentication or pairing
    pub auth_failures: AtomicU64,
    /// Refusals for action names outside the closed set
    pub unknown_actions: AtomicU64,
    /// Handler and execution failures
    pub handler_errors: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the counters at a point in time.
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            unknown_actions: self.unknown_actions.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.dispatched.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.auth_failures.store(0, Ordering::Relaxed);
        self.unknown_actions.store(0, Ordering::Relaxed);
        self.handler_errors.store(0, Ordering::Relaxed);
    }

    fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
        self.inc_rejected();
    }

    fn inc_unknown_actions(&self) {
        self.unknown_actions.fetch_add(1, Ordering::Relaxed);
        self.inc_rejected();
    }

    fn inc_handler_errors(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        self.inc_rejected();
    }
}

/// Copy of [`DispatchStats`] values at a point in time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub rejected: u64,
    pub auth_failures: u64,
    pub unknown_actions: u64,
    pub handler_errors: u64,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes legacy request bodies to pairing, lifecycle, and host actions.
///
/// The dispatcher:
/// 1. Decodes the base64 JSON envelope
/// 2. Rejects action names outside the closed set, before any auth work
/// 3. Serves pair itself, with its own bootstrap verification
/// 4. Authenticates everything else against the pairing record
/// 5. Routes to the bound handler and encodes the response
pub struct LegacyDispatcher {
    authenticator: LegacyAuthenticator,
    pairing: PairingService,
    registry: ActionRegistry,
    stats: Arc<DispatchStats>,
}

impl LegacyDispatcher {
    pub fn new(
        authenticator: LegacyAuthenticator,
        pairing: PairingService,
        registry: ActionRegistry,
    ) -> Self {
        Self {
            authenticator,
            pairing,
            registry,
            stats: Arc::new(DispatchStats::new()),
        }
    }

    /// Dispatch counters for the host's admin surface.
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Serve one legacy request body, returning the encoded response.
    ///
    /// Failures are encoded through [`CoreError::public_message`], so the
    /// response never carries internal detail.
    pub async fn dispatch(&self, body: &str) -> String {
        self.stats.inc_received();
        match self.run(body).await {
            Ok(value) => {
                self.stats.inc_dispatched();
                encode_success(&value)
            }
            Err(err) => {
                match &err {
                    CoreError::Auth(_) | CoreError::Pairing(_) => {
                        self.stats.inc_auth_failures();
                    }
                    CoreError::UnknownAction(_) | CoreError::NotDispatchable(_) => {
                        self.stats.inc_unknown_actions();
                    }
                    CoreError::BadRequest(_) => self.stats.inc_rejected(),
                    _ => self.stats.inc_handler_errors(),
                }
                if err.is_auth_failure() {
                    warn!(error = %err, "legacy request refused");
                } else {
                    debug!(error = %err, "legacy request failed");
                }
                encode_error(&err.public_message())
            }
        }
    }

    async fn run(&self, body: &str) -> Result<Value, CoreError> {
        let envelope = decode_envelope(body)?;
        let action = LegacyAction::from_wire(&envelope.action)
            .ok_or_else(|| CoreError::UnknownAction(envelope.action.clone()))?;

        if action == LegacyAction::Pair {
            let request: PairRequest = serde_json::from_value(envelope.params)
                .map_err(|_| CoreError::BadRequest("pair parameters are malformed".to_string()))?;
            let outcome = self
                .pairing
                .pair(&request, envelope.id, &envelope.signature)
                .await?;
            return Ok(serde_json::to_value(outcome).unwrap_or_default());
        }

        self.authenticator
            .authenticate(&envelope.action, envelope.id, &envelope.signature)
            .await?;

        match action {
            LegacyAction::Unpair => {
                self.pairing.unpair().await?;
                Ok(json!("unpaired"))
            }
            other => {
                let handler = self
                    .registry
                    .handler(other)
                    .ok_or(CoreError::NotDispatchable(other))?;
                debug!(action = %other, "dispatching legacy action");
                handler.handle(envelope.params).await
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
