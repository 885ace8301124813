//! Storage abstraction for steward pairing state, message counters, and
//! the nonce ledger.
//!
//! This module defines the `StateStore` trait and provides an in-memory
//! implementation for testing and single-process use. Every mutation that
//! enforces a protocol invariant (pairing create-once, strictly-greater
//! counter advance, nonce consume-once) is a single atomic check-and-write
//! against the backend, so concurrent dispatch cannot widen the contract.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// Data Models
// ============================================================================

/// Trust material held for the paired controller.
#[derive(Clone, PartialEq, Eq)]
pub enum TrustMaterial {
    /// Raw Ed25519 public key bytes submitted at pairing time
    ControllerKey(Vec<u8>),
    /// Locally generated seed for the degraded keyed-hash mode
    DegradedSeed([u8; 32]),
}

impl TrustMaterial {
    /// True for the shared-secret fallback.
    pub fn is_degraded(&self) -> bool {
        matches!(self, TrustMaterial::DegradedSeed(_))
    }
}

// The seed authenticates every later message; keep it out of Debug output.
impl fmt::Debug for TrustMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustMaterial::ControllerKey(bytes) => f
                .debug_tuple("ControllerKey")
                .field(&hex::encode(bytes))
                .finish(),
            TrustMaterial::DegradedSeed(_) => f.write_str("DegradedSeed(..)"),
        }
    }
}

/// Record for the established trust relationship with a controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingRecord {
    /// Controller identifier (`"any"` while single-tenant)
    pub controller: String,
    /// Verifying key or degraded seed
    pub trust: TrustMaterial,
    /// Unix timestamp when the pairing was created
    pub created_at: u64,
    /// Unix timestamp of the last authenticated command (optional)
    pub last_used: Option<u64>,
}

/// Outcome of a nonce consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOutcome {
    /// First sighting; the nonce is now burned
    Fresh,
    /// Seen before; the bearer is replaying
    AlreadyUsed,
}

// ============================================================================
// StateStore Trait
// ============================================================================

/// Storage abstraction for steward agent state.
///
/// This trait defines async methods for:
/// - Pairings: the (single) established trust relationship
/// - Message counters: legacy replay floor, one per controller
/// - Nonce ledger: consume-once tokens for the current protocol
#[async_trait]
pub trait StateStore: Send + Sync {
    // -------------------------------------------------------------------------
    // Pairing Operations
    // -------------------------------------------------------------------------

    /// Create a pairing record if and only if none exists for its
    /// controller. This is the compare-and-set behind the `AlreadyPaired`
    /// guarantee: of N concurrent creates, exactly one succeeds.
    ///
    /// # Returns
    /// * `Ok(())` when the record was created
    /// * `Err(StoreError::AlreadyExists)` when the controller is paired
    /// * `Err(StoreError)` if the operation fails
    async fn create_pairing(&self, record: PairingRecord) -> Result<(), StoreError>;

    /// Retrieve the pairing for a controller.
    ///
    /// # Returns
    /// * `Ok(Some(record))` if found
    /// * `Ok(None)` if not found
    /// * `Err(StoreError)` if the operation fails
    async fn load_pairing(&self, controller: &str)
        -> Result<Option<PairingRecord>, StoreError>;

    /// Delete the pairing for a controller, along with its message
    /// counter. The nonce ledger is left alone: burned nonces stay burned
    /// across re-pairing.
    ///
    /// # Returns
    /// * `Ok(())` on success (even if no pairing existed)
    /// * `Err(StoreError)` if the operation fails
    async fn delete_pairing(&self, controller: &str) -> Result<(), StoreError>;

    /// Update the last-used timestamp for a pairing.
    ///
    /// # Returns
    /// * `Ok(())` on success
    /// * `Err(StoreError::NotFound)` if the pairing doesn't exist
    async fn touch_pairing(&self, controller: &str, timestamp: u64)
        -> Result<(), StoreError>;

    /// List all pairings.
    async fn list_pairings(&self) -> Result<Vec<PairingRecord>, StoreError>;

    // -------------------------------------------------------------------------
    // Message Counter Operations
    // -------------------------------------------------------------------------

    /// Overwrite the message counter for a controller. Used once at
    /// pairing time to seed the replay floor.
    async fn set_message_counter(&self, controller: &str, value: u64)
        -> Result<(), StoreError>;

    /// Current message counter for a controller, `0` when unset.
    async fn message_counter(&self, controller: &str) -> Result<u64, StoreError>;

    /// Advance the counter to `candidate` if and only if it is strictly
    /// greater than the stored value. Check and write are one atomic
    /// operation; of N concurrent advances to the same value, exactly one
    /// returns `true`.
    ///
    /// # Returns
    /// * `Ok(true)` when the counter advanced
    /// * `Ok(false)` when `candidate` was at or below the stored value
    /// * `Err(StoreError)` if the operation fails
    async fn advance_message_counter(
        &self,
        controller: &str,
        candidate: u64,
    ) -> Result<bool, StoreError>;

    // -------------------------------------------------------------------------
    // Nonce Ledger Operations
    // -------------------------------------------------------------------------

    /// Check-and-mark a nonce in one atomic operation.
    ///
    /// # Arguments
    /// * `nonce` - Opaque single-use token
    /// * `now` - Current Unix timestamp, recorded for later purging
    ///
    /// # Returns
    /// * `Ok(NonceOutcome::Fresh)` exactly once per nonce
    /// * `Ok(NonceOutcome::AlreadyUsed)` on every later attempt
    /// * `Err(StoreError)` if the operation fails
    async fn consume_nonce(&self, nonce: &str, now: u64)
        -> Result<NonceOutcome, StoreError>;

    /// Drop ledger entries consumed at or before `older_than`. Callers key
    /// this to the anti-forgery validity window so single-use still holds
    /// for every nonce that could be replayed.
    ///
    /// # Returns
    /// * `Ok(count)` - Number of entries deleted
    /// * `Err(StoreError)` if the operation fails
    async fn purge_nonces(&self, older_than: u64) -> Result<usize, StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// Thread-safe in-memory store for testing and single-process agents.
///
/// Uses `RwLock` for concurrent access with multiple readers or a single
/// writer; every CAS contract above is honored under the write lock.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    pairings: Arc<RwLock<HashMap<String, PairingRecord>>>,
    counters: Arc<RwLock<HashMap<String, u64>>>,
    /// nonce -> unix timestamp at consumption
    nonces: Arc<RwLock<HashMap<String, u64>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in an `Arc` for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn create_pairing(&self, record: PairingRecord) -> Result<(), StoreError> {
        let mut pairings = self.pairings.write().await;
        match pairings.entry(record.controller.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.controller)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn load_pairing(
        &self,
        controller: &str,
    ) -> Result<Option<PairingRecord>, StoreError> {
        let pairings = self.pairings.read().await;
        Ok(pairings.get(controller).cloned())
    }

    async fn delete_pairing(&self, controller: &str) -> Result<(), StoreError> {
        self.pairings.write().await.remove(controller);
        self.counters.write().await.remove(controller);
        Ok(())
    }

    async fn touch_pairing(
        &self,
        controller: &str,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let mut pairings = self.pairings.write().await;
        match pairings.get_mut(controller) {
            Some(record) => {
                record.last_used = Some(timestamp);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "pairing for controller {controller:?}"
            ))),
        }
    }

    async fn list_pairings(&self) -> Result<Vec<PairingRecord>, StoreError> {
        let pairings = self.pairings.read().await;
        Ok(pairings.values().cloned().collect())
    }

    async fn set_message_counter(
        &self,
        controller: &str,
        value: u64,
    ) -> Result<(), StoreError> {
        self.counters
            .write()
            .await
            .insert(controller.to_string(), value);
        Ok(())
    }

    async fn message_counter(&self, controller: &str) -> Result<u64, StoreError> {
        let counters = self.counters.read().await;
        Ok(counters.get(controller).copied().unwrap_or(0))
    }

    async fn advance_message_counter(
        &self,
        controller: &str,
        candidate: u64,
    ) -> Result<bool, StoreError> {
        let mut counters = self.counters.write().await;
        let current = counters.get(controller).copied().unwrap_or(0);
        if candidate > current {
            counters.insert(controller.to_string(), candidate);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn consume_nonce(
        &self,
        nonce: &str,
        now: u64,
    ) -> Result<NonceOutcome, StoreError> {
        let mut nonces = self.nonces.write().await;
        match nonces.entry(nonce.to_string()) {
            Entry::Occupied(_) => Ok(NonceOutcome::AlreadyUsed),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(NonceOutcome::Fresh)
            }
        }
    }

    async fn purge_nonces(&self, older_than: u64) -> Result<usize, StoreError> {
        let mut nonces = self.nonces.write().await;
        let before = nonces.len();
        nonces.retain(|_, consumed_at| *consumed_at > older_than);
        Ok(before - nonces.len())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Check whether a controller has an established pairing.
pub async fn is_paired(store: &dyn StateStore, controller: &str) -> Result<bool, StoreError> {
    Ok(store.load_pairing(controller).await?.is_some())
}

// ============================================================================
// Unit Tests
// ============================================================================
