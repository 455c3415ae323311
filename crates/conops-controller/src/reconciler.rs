// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reconciler: a single-flight loop driving apps through the status
//! machine.
//!
//! Each tick snapshots the runtime, requeues interrupted or drifted apps to
//! `pending`, and applies every dispatchable app. The `running` guard drops
//! overlapping ticks; the `syncing` status plus the force-sync 409 keep the
//! at-most-one-apply-per-app invariant across actors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conops_config::model::ReconcilerConfig;
use conops_core::{App, AppStatus, ApplyRequest, ConopsError};
use conops_registry::Registry;
use conops_runtime::{ComposeExecutor, ProjectRuntimeState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::progress::{SyncProgressReporter, SYNC_PROGRESS_FLUSH_INTERVAL};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Parsed reconciler settings.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    pub sync_timeout: Duration,
    pub retry_errors: bool,
}

impl ReconcilerSettings {
    /// Parse duration strings from configuration, falling back to defaults
    /// on invalid values.
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        let interval = match humantime::parse_duration(&config.reconcile_interval) {
            Ok(parsed) if !parsed.is_zero() => parsed,
            _ => {
                warn!(
                    value = %config.reconcile_interval,
                    "invalid reconcile_interval, using default"
                );
                DEFAULT_RECONCILE_INTERVAL
            }
        };
        let sync_timeout = match humantime::parse_duration(&config.sync_timeout) {
            Ok(parsed) if !parsed.is_zero() => parsed,
            _ => {
                warn!(value = %config.sync_timeout, "invalid sync_timeout, using default");
                DEFAULT_SYNC_TIMEOUT
            }
        };
        Self {
            interval,
            sync_timeout,
            retry_errors: config.retry_errors,
        }
    }
}

/// Applies desired state directly on the local host.
pub struct Reconciler {
    registry: Arc<Registry>,
    executor: Arc<ComposeExecutor>,
    settings: ReconcilerSettings,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        executor: Arc<ComposeExecutor>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Run the loop: one immediate pass, then one per tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        self.reconcile_once(&cancel).await;

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the pass above covered it.
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reconciler stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.reconcile_once(&cancel).await;
                }
            }
        }
    }

    /// One reconcile pass. Non-reentrant: overlapping invocations return
    /// immediately.
    pub async fn reconcile_once(&self, cancel: &CancellationToken) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.reconcile_pass(cancel).await;
        self.running.store(false, Ordering::SeqCst);
    }

    async fn reconcile_pass(&self, cancel: &CancellationToken) {
        let runtime_snapshot = match self.capture_runtime_snapshot(cancel).await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    error = %err,
                    "failed to capture runtime snapshot; skipping runtime drift checks"
                );
                None
            }
        };

        let apps = match self.registry.list().await {
            Ok(apps) => apps,
            Err(err) => {
                warn!(error = %err, "failed to list apps");
                return;
            }
        };

        for mut app in apps {
            if cancel.is_cancelled() {
                return;
            }

            if app.status == AppStatus::Syncing {
                // A previous process died mid-apply; pick the app back up.
                self.requeue_pending(&mut app, "recovering_interrupted_sync")
                    .await;
            }

            if app.last_seen_commit.is_empty() {
                continue;
            }

            if app.status == AppStatus::Synced {
                if let Some(snapshot) = &runtime_snapshot {
                    let reason = runtime_drift_reason(&app.id, snapshot);
                    if !reason.is_empty() {
                        self.requeue_pending(&mut app, reason).await;
                    }
                }
            }

            let dispatch = match app.status {
                AppStatus::Pending => true,
                AppStatus::Error => self.settings.retry_errors,
                _ => false,
            };
            if !dispatch {
                continue;
            }

            if let Err(err) = self.sync_app(&app, cancel).await {
                error!(app_id = %app.id, error = %err, "app sync failed");
            }
        }
    }

    async fn capture_runtime_snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, ProjectRuntimeState>, ConopsError> {
        tokio::time::timeout(SNAPSHOT_TIMEOUT, self.executor.snapshot_projects(cancel))
            .await
            .map_err(|_| ConopsError::Timeout {
                duration: SNAPSHOT_TIMEOUT,
            })?
    }

    async fn requeue_pending(&self, app: &mut App, reason: &str) {
        if app.status == AppStatus::Pending {
            return;
        }
        match self
            .registry
            .update_status(&app.id, AppStatus::Pending, None)
            .await
        {
            Ok(()) => {
                app.status = AppStatus::Pending;
                info!(app_id = %app.id, reason = %reason, "requeued app for reconciliation");
            }
            Err(err) => {
                warn!(
                    app_id = %app.id,
                    reason = %reason,
                    error = %err,
                    "failed to requeue app for reconciliation"
                );
            }
        }
    }

    /// Apply one app's desired commit and persist the outcome.
    async fn sync_app(&self, app: &App, cancel: &CancellationToken) -> Result<(), ConopsError> {
        // Best-effort: the terminal update_sync_result is the write that
        // matters; a failure here is logged and the apply proceeds.
        if let Err(err) = self
            .registry
            .update_status(&app.id, AppStatus::Syncing, None)
            .await
        {
            warn!(app_id = %app.id, error = %err, "failed to mark app syncing");
        }

        let deploy_key = match self.registry.get_deploy_key(&app.id).await {
            Ok(key) => key,
            Err(err) => {
                let _ = self
                    .registry
                    .update_status(&app.id, AppStatus::Error, None)
                    .await;
                return Err(ConopsError::Internal(format!(
                    "failed to load app credentials: {err}"
                )));
            }
        };

        let apply_cancel = cancel.child_token();
        let watchdog = {
            let apply_cancel = apply_cancel.clone();
            let timeout = self.settings.sync_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                apply_cancel.cancel();
            })
        };

        let reporter = Arc::new(SyncProgressReporter::new(
            self.registry.clone(),
            app.id.clone(),
            SYNC_PROGRESS_FLUSH_INTERVAL,
        ));

        let request = ApplyRequest {
            app_id: app.id.clone(),
            inline_content: String::new(),
            env_vars: HashMap::new(),
            repo_url: app.repo_url.clone(),
            branch: app.branch.clone(),
            compose_path: app.compose_path.clone(),
            commit_hash: app.last_seen_commit.clone(),
            deploy_key,
        };

        let result = self
            .executor
            .apply(request, apply_cancel, Some(reporter.as_progress_fn()))
            .await;
        watchdog.abort();
        reporter.flush().await;

        let now = chrono::Utc::now().to_rfc3339();
        match result {
            Err(apply_err) => {
                error!(
                    app_id = %app.id,
                    commit = %app.last_seen_commit,
                    error = %apply_err,
                    "sync apply failed"
                );
                let _ = self
                    .registry
                    .update_sync_result(
                        &app.id,
                        AppStatus::Error,
                        &now,
                        &app.last_synced_commit,
                        &app.last_synced_commit_message,
                        &apply_err.transcript,
                        &apply_err.to_string(),
                    )
                    .await;
                Err(apply_err.source)
            }
            Ok(output) => {
                if let Err(err) = self
                    .registry
                    .update_sync_result(
                        &app.id,
                        AppStatus::Synced,
                        &now,
                        &app.last_seen_commit,
                        &app.last_seen_commit_message,
                        &output,
                        "",
                    )
                    .await
                {
                    warn!(app_id = %app.id, error = %err, "failed to update app status");
                }
                info!(app_id = %app.id, commit = %app.last_seen_commit, "app synced");
                Ok(())
            }
        }
    }
}

/// Why a `synced` app needs another apply, or empty when the runtime matches.
pub fn runtime_drift_reason(
    app_id: &str,
    snapshot: &HashMap<String, ProjectRuntimeState>,
) -> &'static str {
    let project = conops_runtime::project_name(app_id);
    let Some(state) = snapshot.get(&project) else {
        return "runtime_missing";
    };
    if state.container_count == 0 {
        return "runtime_missing";
    }
    if state.unhealthy_count > 0 {
        return "runtime_unhealthy";
    }
    if state.exited_count > 0 {
        return "runtime_exited";
    }
    if state.running_count < state.container_count {
        return "runtime_not_running";
    }
    ""
}
