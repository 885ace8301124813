use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use steward_core::trust::{KeyRing, SigningKeyEntry};
use steward_fetch::FetchConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// One named controller verifying key from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyConfig {
    pub name: String,
    /// Key material: raw base64, hex, or PEM `BEGIN PUBLIC KEY`
    pub material: String,
    /// Unix timestamp after which the key stops resolving
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_addr: String,

    // Trust settings
    pub controller: String,
    pub allow_degraded: bool,
    pub signing_keys: Vec<SigningKeyConfig>,

    // Persistence; no path means volatile in-memory state
    pub state_path: Option<PathBuf>,

    // Payload execution
    pub spool_dir: PathBuf,
    pub interpreter: Option<PathBuf>,

    // Fetch settings
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_payload_bytes: usize,
    pub fallback_ca_file: Option<PathBuf>,

    // Logging
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            controller: "any".to_string(),
            allow_degraded: false,
            signing_keys: Vec::new(),
            state_path: None,
            spool_dir: PathBuf::from("spool"),
            interpreter: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            max_payload_bytes: 64 * 1024 * 1024,
            fallback_ca_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(e.to_string()))?;

        let config: AgentConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("STEWARD_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(controller) = std::env::var("STEWARD_CONTROLLER") {
            self.controller = controller;
        }
        if let Ok(path) = std::env::var("STEWARD_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("STEWARD_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(dir);
        }
        if let Ok(flag) = std::env::var("STEWARD_ALLOW_DEGRADED") {
            if let Ok(value) = flag.parse::<bool>() {
                self.allow_degraded = value;
            }
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "bind_addr {:?} is not a socket address",
                self.bind_addr
            )));
        }
        if self.controller.is_empty() {
            return Err(ConfigError::ValidationError(
                "controller must not be empty".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "fetch timeouts must be nonzero".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_payload_bytes must be nonzero".to_string(),
            ));
        }
        if let Some(interpreter) = &self.interpreter {
            if !interpreter.is_file() {
                return Err(ConfigError::ValidationError(format!(
                    "interpreter not found: {}",
                    interpreter.display()
                )));
            }
        }
        if let Some(ca_file) = &self.fallback_ca_file {
            if !ca_file.is_file() {
                return Err(ConfigError::ValidationError(format!(
                    "fallback CA file not found: {}",
                    ca_file.display()
                )));
            }
        }
        self.build_keyring()?;
        Ok(())
    }

    /// Decode the configured signing keys into the rotation set.
    pub fn build_keyring(&self) -> Result<KeyRing, ConfigError> {
        let mut entries = Vec::with_capacity(self.signing_keys.len());
        for key in &self.signing_keys {
            let entry = SigningKeyEntry::from_material(&key.name, &key.material, key.expires_at)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            entries.push(entry);
        }
        KeyRing::new(entries).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Fetch client settings, with the fallback CA bundle loaded from disk.
    pub fn fetch_config(&self) -> Result<FetchConfig, ConfigError> {
        let fallback_ca_pem = match &self.fallback_ca_file {
            Some(path) => Some(
                std::fs::read(path).map_err(|e| ConfigError::FileNotFound(e.to_string()))?,
            ),
            None => None,
        };
        Ok(FetchConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_body_bytes: self.max_payload_bytes,
            fallback_ca_pem,
        })
    }
}
