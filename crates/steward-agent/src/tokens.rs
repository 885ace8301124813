//! Anti-forgery tokens for the two-phase confirmation flow.
//!
//! Tokens are a keyed hash over the scope and a coarse time window, under
//! a secret generated at boot. A token stays valid through the window it
//! was issued in and the following one, so a confirmation page that sat
//! open for a while still submits. Restarting the agent invalidates every
//! outstanding page, which is acceptable: the operator just reloads.
//!
//! The one-shot nonce, not this token, is the replay defense. Within its
//! validity window a form token verifies as often as it is presented.

use async_trait::async_trait;

use steward_core::command::FormTokenService;
use steward_core::errors::CoreError;
use steward_core::types::unix_now;
use steward_crypto::secret::SharedSecret;
use steward_crypto::utils::constant_time_compare;

/// Tokens roll over twice a day.
const WINDOW_SECS: u64 = 12 * 60 * 60;

/// Time-windowed keyed-hash tokens under a per-boot secret.
pub struct WindowedFormTokens {
    secret: SharedSecret,
}

impl WindowedFormTokens {
    pub fn new() -> Self {
        Self {
            secret: SharedSecret::generate(),
        }
    }

    fn tag_for(&self, scope: &str, window: u64) -> String {
        let message = format!("{window}|{scope}");
        hex::encode(self.secret.tag(message.as_bytes()))
    }

    fn current_window() -> u64 {
        unix_now() / WINDOW_SECS
    }
}

impl Default for WindowedFormTokens {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormTokenService for WindowedFormTokens {
    async fn issue(&self, scope: &str) -> Result<String, CoreError> {
        Ok(self.tag_for(scope, Self::current_window()))
    }

    async fn verify(&self, scope: &str, token: &str) -> Result<bool, CoreError> {
        let window = Self::current_window();
        let current = self.tag_for(scope, window);
        if constant_time_compare(current.as_bytes(), token.as_bytes()) {
            return Ok(true);
        }
        let previous = self.tag_for(scope, window.wrapping_sub(1));
        Ok(constant_time_compare(previous.as_bytes(), token.as_bytes()))
    }
}
