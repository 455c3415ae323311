// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `conops serve` command implementation.
//!
//! Wires the state store, credential vault, registry, compose executor, git
//! watcher, reconciler, and HTTP gateway together and runs until a shutdown
//! signal arrives. Startup order matters: the store and vault must be ready
//! before any control loop starts.

use std::path::Path;
use std::sync::Arc;

use conops_config::ConopsConfig;
use conops_controller::{GitWatcher, Reconciler, ReconcilerSettings};
use conops_core::{ConopsError, RuntimeApplier, RuntimeCleaner, StateStore};
use conops_gateway::GatewayState;
use conops_registry::Registry;
use conops_runtime::ComposeExecutor;
use conops_vault::CredentialVault;
use tracing::{info, warn};

use crate::shutdown;

/// Run the `conops serve` command.
pub async fn run_serve(config: ConopsConfig) -> Result<(), ConopsError> {
    init_tracing(&config.server.log_level);

    info!("starting conops serve");

    let store = open_store(&config).await?;

    let vault = match CredentialVault::bootstrap(
        config.credentials.encryption_key.as_deref(),
        Path::new(&config.credentials.encryption_key_file),
    ) {
        Ok(vault) => {
            info!(source = vault.key_source(), "credential encryption is enabled");
            Some(Arc::new(vault))
        }
        Err(err) => {
            // Deploy-key apps cannot be registered or synced without a vault;
            // public apps still work.
            warn!(error = %err, "credential encryption is unavailable");
            None
        }
    };

    let registry = Arc::new(Registry::new(store, vault));
    let executor = Arc::new(ComposeExecutor::new(&config.runtime, &config.repo_auth));

    let cancel = shutdown::install_signal_handler();

    let watcher = Arc::new(GitWatcher::new(
        registry.clone(),
        config.watcher.cache_dir.clone(),
        config.repo_auth.known_hosts_file.clone(),
    ));
    {
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            watcher.run(watcher_cancel).await;
        });
        info!(cache_dir = %config.watcher.cache_dir, "git watcher started");
    }

    let settings = ReconcilerSettings::from_config(&config.reconciler);
    let reconciler = Arc::new(Reconciler::new(registry.clone(), executor.clone(), settings));
    {
        let reconciler = reconciler.clone();
        let reconciler_cancel = cancel.clone();
        tokio::spawn(async move {
            reconciler.run(reconciler_cancel).await;
        });
        info!(
            interval = ?settings.interval,
            sync_timeout = ?settings.sync_timeout,
            retry_errors = settings.retry_errors,
            "reconciler started"
        );
    }

    let state = GatewayState {
        registry,
        applier: Some(executor.clone() as Arc<dyn RuntimeApplier>),
        cleaner: Some(executor as Arc<dyn RuntimeCleaner>),
        shutdown: cancel.clone(),
    };
    conops_gateway::start_server(&config.server.host, config.server.port, state).await?;

    info!("conops serve shutdown complete");
    Ok(())
}

async fn open_store(config: &ConopsConfig) -> Result<Arc<dyn StateStore>, ConopsError> {
    match config.storage.backend.as_str() {
        "sqlite" => {
            let store = conops_store::SqliteStore::open(&config.storage.database_path).await?;
            info!(path = %config.storage.database_path, "using SQLite store");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let connection_string =
                config.storage.connection_string.as_deref().ok_or_else(|| {
                    ConopsError::Config(
                        "storage.connection_string is required for the postgres backend"
                            .to_string(),
                    )
                })?;
            let store = conops_store::PostgresStore::connect(connection_string).await?;
            info!("using PostgreSQL store");
            Ok(Arc::new(store))
        }
        other => Err(ConopsError::Config(format!(
            "unsupported storage backend: {other}"
        ))),
    }
}

/// Initialize the tracing subscriber with the configured log level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("conops={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}
