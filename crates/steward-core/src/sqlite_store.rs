//! SQLite-based persistent storage implementation.
//!
//! Production backend for agent state using SQLite with WAL, schema
//! migrations, and conditional SQL for the compare-and-set operations the
//! `StateStore` contract requires. Row-change counts are how SQLite
//! reports whether a conditional write took effect, so every CAS here is
//! an `INSERT OR IGNORE` or guarded `UPDATE` checked through
//! `Connection::execute`'s return value.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::store::{NonceOutcome, PairingRecord, StateStore, StoreError, TrustMaterial};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
/// Increment this when adding new migrations.
#[allow(dead_code)]
const SCHEMA_VERSION: i32 = 1;

// Discriminants for the trust_kind column.
const TRUST_KIND_KEY: i64 = 0;
const TRUST_KIND_SEED: i64 = 1;

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-based persistent store implementation.
///
/// Provides durable storage for the pairing record, message counter, and
/// nonce ledger with:
/// - Atomic conditional writes for every CAS contract
/// - Schema migrations for version upgrades
/// - Thread-safe access via Mutex
pub struct SqliteStore {
    /// SQLite connection wrapped in a mutex for thread-safe access
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new SQLite store at the specified path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::OperationFailed(format!("failed to open database: {}", e))
        })?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite store for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations to ensure schema is up to date.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| {
            StoreError::OperationFailed(format!("failed to create schema_version: {}", e))
        })?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            -- Pairings table (one row per controller identifier)
            CREATE TABLE IF NOT EXISTS pairings (
                controller TEXT PRIMARY KEY,
                trust_kind INTEGER NOT NULL,
                trust_material BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER
            );

            -- Legacy replay floor
            CREATE TABLE IF NOT EXISTS message_counters (
                controller TEXT PRIMARY KEY,
                counter INTEGER NOT NULL
            );

            -- Burned single-use tokens
            CREATE TABLE IF NOT EXISTS used_nonces (
                nonce TEXT PRIMARY KEY,
                consumed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_used_nonces_consumed
                ON used_nonces(consumed_at);

            -- Record schema version
            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helper methods for serialization
    // -------------------------------------------------------------------------

    /// Split trust material into its column pair.
    fn serialize_trust(trust: &TrustMaterial) -> (i64, Vec<u8>) {
        match trust {
            TrustMaterial::ControllerKey(bytes) => (TRUST_KIND_KEY, bytes.clone()),
            TrustMaterial::DegradedSeed(seed) => (TRUST_KIND_SEED, seed.to_vec()),
        }
    }

    /// Rebuild trust material from its column pair.
    fn deserialize_trust(kind: i64, material: Vec<u8>) -> Result<TrustMaterial, StoreError> {
        match kind {
            TRUST_KIND_KEY => Ok(TrustMaterial::ControllerKey(material)),
            TRUST_KIND_SEED => {
                let seed: [u8; 32] = material.as_slice().try_into().map_err(|_| {
                    StoreError::OperationFailed(format!(
                        "corrupt degraded seed: {} bytes",
                        material.len()
                    ))
                })?;
                Ok(TrustMaterial::DegradedSeed(seed))
            }
            other => Err(StoreError::OperationFailed(format!(
                "unknown trust kind {}",
                other
            ))),
        }
    }

    /// Assemble a record from raw column values.
    fn row_to_pairing(
        controller: String,
        kind: i64,
        material: Vec<u8>,
        created_at: i64,
        last_used: Option<i64>,
    ) -> Result<PairingRecord, StoreError> {
        Ok(PairingRecord {
            controller,
            trust: Self::deserialize_trust(kind, material)?,
            created_at: created_at as u64,
            last_used: last_used.map(|t| t as u64),
        })
    }
}

// ============================================================================
// StateStore Trait Implementation
// ============================================================================

#[async_trait]
impl StateStore for SqliteStore {
    // -------------------------------------------------------------------------
    // Pairing Operations
    // -------------------------------------------------------------------------

    async fn create_pairing(&self, record: PairingRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let (kind, material) = Self::serialize_trust(&record.trust);

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO pairings
                     (controller, trust_kind, trust_material, created_at, last_used)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.controller,
                    kind,
                    material,
                    record.created_at as i64,
                    record.last_used.map(|t| t as i64),
                ],
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to save pairing: {}", e)))?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists(record.controller));
        }
        Ok(())
    }

    async fn load_pairing(
        &self,
        controller: &str,
    ) -> Result<Option<PairingRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT controller, trust_kind, trust_material, created_at, last_used
                 FROM pairings WHERE controller = ?1",
                params![controller],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::OperationFailed(format!("failed to load pairing: {}", e)))?;

        row.map(|(controller, kind, material, created_at, last_used)| {
            Self::row_to_pairing(controller, kind, material, created_at, last_used)
        })
        .transpose()
    }

    async fn delete_pairing(&self, controller: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM pairings WHERE controller = ?1",
            params![controller],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to delete pairing: {}", e)))?;
        conn.execute(
            "DELETE FROM message_counters WHERE controller = ?1",
            params![controller],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to delete counter: {}", e)))?;
        Ok(())
    }

    async fn touch_pairing(
        &self,
        controller: &str,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows_affected = conn
            .execute(
                "UPDATE pairings SET last_used = ?1 WHERE controller = ?2",
                params![timestamp as i64, controller],
            )
            .map_err(|e| {
                StoreError::OperationFailed(format!("failed to touch pairing: {}", e))
            })?;

        if rows_affected == 0 {
            return Err(StoreError::NotFound(format!(
                "pairing for controller {controller:?}"
            )));
        }
        Ok(())
    }

    async fn list_pairings(&self) -> Result<Vec<PairingRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT controller, trust_kind, trust_material, created_at, last_used
                 FROM pairings",
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .map_err(|e| StoreError::OperationFailed(format!("failed to list pairings: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                StoreError::OperationFailed(format!("failed to collect pairings: {}", e))
            })?;

        rows.into_iter()
            .map(|(controller, kind, material, created_at, last_used)| {
                Self::row_to_pairing(controller, kind, material, created_at, last_used)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Message Counter Operations
    // -------------------------------------------------------------------------

    async fn set_message_counter(
        &self,
        controller: &str,
        value: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO message_counters (controller, counter) VALUES (?1, ?2)",
            params![controller, value as i64],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to set counter: {}", e)))?;
        Ok(())
    }

    async fn message_counter(&self, controller: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let counter: Option<i64> = conn
            .query_row(
                "SELECT counter FROM message_counters WHERE controller = ?1",
                params![controller],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::OperationFailed(format!("failed to read counter: {}", e)))?;
        Ok(counter.unwrap_or(0) as u64)
    }

    async fn advance_message_counter(
        &self,
        controller: &str,
        candidate: u64,
    ) -> Result<bool, StoreError> {
        // Both statements run under the connection mutex, so the
        // ensure-row and the guarded update act as one operation.
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO message_counters (controller, counter) VALUES (?1, 0)",
            params![controller],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to seed counter: {}", e)))?;

        let advanced = conn
            .execute(
                "UPDATE message_counters SET counter = ?2
                 WHERE controller = ?1 AND counter < ?2",
                params![controller, candidate as i64],
            )
            .map_err(|e| {
                StoreError::OperationFailed(format!("failed to advance counter: {}", e))
            })?;

        Ok(advanced > 0)
    }

    // -------------------------------------------------------------------------
    // Nonce Ledger Operations
    // -------------------------------------------------------------------------

    async fn consume_nonce(
        &self,
        nonce: &str,
        now: u64,
    ) -> Result<NonceOutcome, StoreError> {
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO used_nonces (nonce, consumed_at) VALUES (?1, ?2)",
                params![nonce, now as i64],
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to burn nonce: {}", e)))?;

        if inserted == 1 {
            Ok(NonceOutcome::Fresh)
        } else {
            Ok(NonceOutcome::AlreadyUsed)
        }
    }

    async fn purge_nonces(&self, older_than: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count = conn
            .execute(
                "DELETE FROM used_nonces WHERE consumed_at <= ?1",
                params![older_than as i64],
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to purge nonces: {}", e)))?;
        Ok(count)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
