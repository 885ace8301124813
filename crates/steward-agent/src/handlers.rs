//! Reference handlers for the legacy action set.
//!
//! The registry must bind every dispatchable action before the dispatcher
//! starts. Stats and version reporting are real; the content actions
//! belong to the embedding host and are bound to a handler that says so,
//! which keeps the closed-set guarantee without pretending the demo agent
//! has a content store behind it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use steward_core::actions::{
    ActionHandler, ActionRegistry, ActionRegistryBuilder, LegacyAction, RegistryError,
};
use steward_core::errors::CoreError;
use steward_core::pairing::PairingService;
use steward_core::types::{AGENT_VERSION, PROTOCOL_VERSION};

/// Reports the pairing snapshot to the controller.
pub struct StatsHandler {
    pairing: PairingService,
}

impl StatsHandler {
    pub fn new(pairing: PairingService) -> Self {
        Self { pairing }
    }
}

#[async_trait]
impl ActionHandler for StatsHandler {
    async fn handle(&self, _params: Value) -> Result<Value, CoreError> {
        let snapshot = self.pairing.snapshot().await?;
        Ok(serde_json::to_value(snapshot).unwrap_or_default())
    }
}

/// Reports build and protocol versions.
pub struct VersionHandler;

#[async_trait]
impl ActionHandler for VersionHandler {
    async fn handle(&self, _params: Value) -> Result<Value, CoreError> {
        Ok(json!({
            "agent_version": AGENT_VERSION,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }
}

/// Stands in for actions the embedding host has not wired up.
pub struct UnwiredAction {
    action: LegacyAction,
}

impl UnwiredAction {
    pub fn new(action: LegacyAction) -> Self {
        Self { action }
    }
}

#[async_trait]
impl ActionHandler for UnwiredAction {
    async fn handle(&self, _params: Value) -> Result<Value, CoreError> {
        Err(CoreError::Execution(format!(
            "{} is not wired to a host integration",
            self.action
        )))
    }
}

/// Registry used by the demo binary: every dispatchable action bound.
pub fn reference_registry(pairing: PairingService) -> Result<ActionRegistry, RegistryError> {
    ActionRegistryBuilder::new()
        .bind(LegacyAction::GetStats, Arc::new(StatsHandler::new(pairing)))?
        .bind(LegacyAction::CheckVersion, Arc::new(VersionHandler))?
        .bind(
            LegacyAction::Backup,
            Arc::new(UnwiredAction::new(LegacyAction::Backup)),
        )?
        .bind(
            LegacyAction::CreateContent,
            Arc::new(UnwiredAction::new(LegacyAction::CreateContent)),
        )?
        .bind(
            LegacyAction::Moderate,
            Arc::new(UnwiredAction::new(LegacyAction::Moderate)),
        )?
        .bind(
            LegacyAction::InstallBundle,
            Arc::new(UnwiredAction::new(LegacyAction::InstallBundle)),
        )?
        .build()
}
