//! Closed set of legacy actions and the handler registry.
//!
//! The legacy surface accepts only the action names listed here; anything
//! else is rejected before authentication runs. Pair and unpair are
//! lifecycle actions served by the agent itself. The rest are host
//! capabilities, bound to handlers at startup through
//! [`ActionRegistryBuilder`], which refuses to build until every
//! dispatchable action has a handler. A missing binding is a deployment
//! mistake and surfaces at boot, not on the first inbound command.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::errors::CoreError;

// ============================================================================
// Action Enum
// ============================================================================

/// Every action the legacy surface will dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyAction {
    /// Establish the pairing (lifecycle, handled by the agent)
    Pair,
    /// Remove the pairing (lifecycle, handled by the agent)
    Unpair,
    /// Report host statistics
    GetStats,
    /// Produce a host backup
    Backup,
    /// Create content in the host
    CreateContent,
    /// Moderate a host comment
    Moderate,
    /// Install a bundle into the host
    InstallBundle,
    /// Report agent and host versions
    CheckVersion,
}

impl LegacyAction {
    pub const ALL: [LegacyAction; 8] = [
        LegacyAction::Pair,
        LegacyAction::Unpair,
        LegacyAction::GetStats,
        LegacyAction::Backup,
        LegacyAction::CreateContent,
        LegacyAction::Moderate,
        LegacyAction::InstallBundle,
        LegacyAction::CheckVersion,
    ];

    /// Name used on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            LegacyAction::Pair => "pair",
            LegacyAction::Unpair => "unpair",
            LegacyAction::GetStats => "get_stats",
            LegacyAction::Backup => "backup",
            LegacyAction::CreateContent => "create_content",
            LegacyAction::Moderate => "moderate",
            LegacyAction::InstallBundle => "install_bundle",
            LegacyAction::CheckVersion => "check_version",
        }
    }

    /// Parse a wire name. Unknown names are not actions.
    pub fn from_wire(name: &str) -> Option<LegacyAction> {
        LegacyAction::ALL
            .into_iter()
            .find(|action| action.wire_name() == name)
    }

    /// Whether dispatch goes through the handler registry. Lifecycle
    /// actions are served by the agent and cannot be rebound.
    pub fn requires_handler(&self) -> bool {
        !matches!(self, LegacyAction::Pair | LegacyAction::Unpair)
    }
}

impl fmt::Display for LegacyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ============================================================================
// Handler Registry
// ============================================================================

/// Host capability behind one dispatchable action.
///
/// Implementations receive the request's `params` object and return the
/// JSON value to wrap in a success response. Failures map to wire-safe
/// messages through [`CoreError::public_message`].
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value, CoreError>;
}

/// Startup-time registry construction failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A dispatchable action was left without a handler
    #[error("no handler bound for action {0:?}")]
    MissingHandler(LegacyAction),

    /// Attempted to bind a lifecycle action
    #[error("action {0:?} is served by the agent and cannot be bound")]
    NotBindable(LegacyAction),
}

/// Builder that collects handler bindings and validates completeness.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    handlers: HashMap<LegacyAction, Arc<dyn ActionHandler>>,
}

impl ActionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a dispatchable action.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotBindable`] for lifecycle actions.
    pub fn bind(
        mut self,
        action: LegacyAction,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Self, RegistryError> {
        if !action.requires_handler() {
            return Err(RegistryError::NotBindable(action));
        }
        self.handlers.insert(action, handler);
        Ok(self)
    }

    /// Validate that every dispatchable action is bound and produce the
    /// registry.
    pub fn build(self) -> Result<ActionRegistry, RegistryError> {
        for action in LegacyAction::ALL {
            if action.requires_handler() && !self.handlers.contains_key(&action) {
                return Err(RegistryError::MissingHandler(action));
            }
        }
        Ok(ActionRegistry {
            handlers: self.handlers,
        })
    }
}

/// Immutable action-to-handler table, complete by construction.
pub struct ActionRegistry {
    handlers: HashMap<LegacyAction, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Handler for a dispatchable action; `None` for lifecycle actions.
    pub fn handler(&self, action: LegacyAction) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&action).cloned()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
