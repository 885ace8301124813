//! Reference payload executor.
//!
//! Stages every fetched payload into a spool directory and, when an
//! interpreter is configured, runs it as `interpreter <staged-file>` and
//! captures the outcome. Without an interpreter the executor only stages,
//! which is the safe default for hosts that review payloads out of band.
//!
//! Staged files are kept after the run so the operator can inspect what
//! was executed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use steward_core::command::{ExecutionContext, ExecutionReport, PayloadExecutor};
use steward_core::errors::CoreError;
use steward_core::types::unix_now;

static STAGE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub struct StagedScriptExecutor {
    spool_dir: PathBuf,
    interpreter: Option<PathBuf>,
}

impl StagedScriptExecutor {
    pub fn new(spool_dir: PathBuf, interpreter: Option<PathBuf>) -> Self {
        Self {
            spool_dir,
            interpreter,
        }
    }

    /// Spool file name for one payload. Derived only from the timestamp,
    /// a process-local sequence, and the alphanumeric characters of the
    /// nonce, so controller-chosen text can never traverse out of the
    /// spool directory.
    fn stage_name(nonce: &str) -> String {
        let slug: String = nonce
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(24)
            .collect();
        let slug = if slug.is_empty() {
            "payload".to_string()
        } else {
            slug
        };
        let seq = STAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}.payload", unix_now(), seq, slug)
    }

    async fn stage(&self, payload: &[u8], nonce: &str) -> Result<PathBuf, CoreError> {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|e| {
                CoreError::Execution(format!(
                    "could not create spool directory {}: {e}",
                    self.spool_dir.display()
                ))
            })?;
        let path = self.spool_dir.join(Self::stage_name(nonce));
        tokio::fs::write(&path, payload).await.map_err(|e| {
            CoreError::Execution(format!("could not stage payload to {}: {e}", path.display()))
        })?;
        Ok(path)
    }
}

#[async_trait]
impl PayloadExecutor for StagedScriptExecutor {
    async fn execute(
        &self,
        payload: &[u8],
        context: &ExecutionContext,
    ) -> Result<ExecutionReport, CoreError> {
        let staged = self.stage(payload, &context.nonce).await?;
        info!(
            path = %staged.display(),
            bytes = payload.len(),
            url = %context.command_url,
            "payload staged"
        );

        let Some(interpreter) = &self.interpreter else {
            return Ok(ExecutionReport {
                summary: format!("payload staged to {}", staged.display()),
                output: None,
            });
        };

        debug!(interpreter = %interpreter.display(), "running staged payload");
        let output = Command::new(interpreter)
            .arg(&staged)
            .output()
            .await
            .map_err(|e| {
                CoreError::Execution(format!(
                    "failed to launch {}: {e}",
                    interpreter.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Execution(format!(
                "interpreter exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ExecutionReport {
            summary: format!("payload ran via {}", interpreter.display()),
            output: (!stdout.is_empty()).then_some(stdout),
        })
    }
}
