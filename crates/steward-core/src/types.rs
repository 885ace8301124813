use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Agent build version reported to the controller.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol generation the agent speaks. Generation 1 is the legacy
/// POST-envelope surface, generation 2 the signed-token surface.
pub const PROTOCOL_VERSION: u32 = 2;

/// Controller identifier used while the agent trusts a single controller.
pub const WILDCARD_CONTROLLER: &str = "any";

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Status snapshot returned after pairing and on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_version: String,
    pub protocol_version: u32,
    /// True when the pairing relies on the shared-secret fallback.
    pub degraded: bool,
    /// Highest legacy message id accepted so far.
    pub message_counter: u64,
}
