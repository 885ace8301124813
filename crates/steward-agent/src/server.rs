//! Agent assembly and HTTP serving.
//!
//! Builds the library collaborators out of configuration, wires them into
//! the pipeline and dispatcher, and serves the routes. Also owns the
//! background nonce purge.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tracing::{info, warn};

use steward_core::command::CommandPipeline;
use steward_core::legacy::{LegacyAuthenticator, LegacyDispatcher};
use steward_core::pairing::{PairingPolicy, PairingService};
use steward_core::sqlite_store::SqliteStore;
use steward_core::store::{InMemoryStore, StateStore};
use steward_core::types::unix_now;
use steward_fetch::FetchClient;

use crate::api::{self, AppState};
use crate::config::AgentConfig;
use crate::executor::StagedScriptExecutor;
use crate::handlers;
use crate::tokens::WindowedFormTokens;

/// Consumed nonces older than this may be purged; matches the
/// order-of-a-day validity window of the signed commands.
const NONCE_RETENTION_SECS: u64 = 24 * 60 * 60;

const PURGE_INTERVAL_SECS: u64 = 60 * 60;

pub struct AgentServer {
    config: AgentConfig,
    state: AppState,
    store: Arc<dyn StateStore>,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentServer {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let store: Arc<dyn StateStore> = match &config.state_path {
            Some(path) => Arc::new(SqliteStore::new(path)?),
            None => {
                warn!("no state_path configured; trust state will not survive a restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let keyring = config.build_keyring()?;
        let policy = PairingPolicy {
            allow_degraded: config.allow_degraded,
        };
        let pairing =
            PairingService::for_controller(Arc::clone(&store), policy, config.controller.clone());
        let authenticator =
            LegacyAuthenticator::for_controller(Arc::clone(&store), config.controller.clone());
        let registry = handlers::reference_registry(pairing.clone())?;
        let dispatcher = Arc::new(LegacyDispatcher::new(authenticator, pairing.clone(), registry));

        let fetcher = FetchClient::new(config.fetch_config()?)?;
        let executor = Arc::new(StagedScriptExecutor::new(
            config.spool_dir.clone(),
            config.interpreter.clone(),
        ));
        let form_tokens = Arc::new(WindowedFormTokens::new());
        let pipeline = Arc::new(CommandPipeline::new(
            keyring.clone(),
            Arc::clone(&store),
            fetcher,
            executor,
            form_tokens,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            state: AppState {
                pipeline,
                dispatcher,
                pairing,
                keyring,
            },
            store,
            shutdown_tx,
        })
    }

    /// The served routes, for embedding in tests or a larger service.
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        // Start nonce purge task
        let store = Arc::clone(&self.store);
        let purge_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(Self::purge_task(store, purge_shutdown));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        info!("steward-agent listening on {}", self.config.bind_addr);

        let shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(Self::shutdown_signal(shutdown_rx))
            .await?;

        Ok(())
    }

    async fn purge_task(store: Arc<dyn StateStore>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(PURGE_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = unix_now().saturating_sub(NONCE_RETENTION_SECS);
                    match store.purge_nonces(cutoff).await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "purged spent nonces"),
                        Err(err) => warn!(error = %err, "nonce purge failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown requested");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/steward/rpc", post(api::legacy_rpc))
        .route("/steward/status", get(api::status))
        .route("/", get(api::public_get).post(api::public_post))
        .with_state(state)
}
