//! Site Steward Core - trust and command handling for the embedded agent.
//!
//! This crate implements:
//! - Pairing handshake between the agent and its remote controller
//! - Named signing-key trust store with rotation and expiry
//! - Legacy command authentication (signature + monotonic message counter)
//! - Current-protocol fetch-and-execute pipeline with two-phase confirmation
//! - Nonce ledger with atomic consume-once semantics
//! - Persistent storage abstraction
//!
//! Business actions (backups, content records, moderation) and request
//! routing belong to the embedding host; this crate exposes the traits the
//! host implements and never renders output itself.

#![forbid(unsafe_code)]

// Trust establishment
pub mod pairing;
pub mod trust;

// Command surfaces
pub mod actions;
pub mod command;
pub mod legacy;

// Infrastructure
pub mod store;

// Supporting modules
pub mod errors;
pub mod types;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
