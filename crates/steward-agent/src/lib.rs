//! Site Steward Agent - host adapter around the steward libraries.
//!
//! This crate provides what an embedding needs around `steward-core`:
//! configuration, logging bootstrap, reference collaborator
//! implementations, and a thin HTTP surface routing the two wire
//! protocols into the library.

pub mod api;
pub mod config;
pub mod executor;
pub mod handlers;
pub mod server;
pub mod tokens;

pub use server::AgentServer;
