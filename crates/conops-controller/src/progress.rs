// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Throttled persistence of in-flight apply transcripts.
//!
//! The executor invokes the progress callback after every output chunk;
//! writing each of those to the store would hammer it during image pulls.
//! The reporter keeps the latest transcript and persists at most once per
//! flush interval through a single worker task, so writes reach the store in
//! order and [`flush`](SyncProgressReporter::flush) drains everything before
//! the terminal sync result is written.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conops_core::ProgressFn;
use conops_registry::Registry;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Default minimum spacing between progress writes.
pub const SYNC_PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum Command {
    Persist(String),
    Drain(oneshot::Sender<()>),
}

struct ReporterState {
    last_flush: Option<Instant>,
    last_value: String,
}

/// Persists the growing transcript of one apply to `last_sync_output`.
pub struct SyncProgressReporter {
    app_id: String,
    interval: Duration,
    state: Mutex<ReporterState>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SyncProgressReporter {
    pub fn new(registry: Arc<Registry>, app_id: impl Into<String>, interval: Duration) -> Self {
        let app_id = app_id.into();
        let interval = if interval.is_zero() {
            SYNC_PROGRESS_FLUSH_INTERVAL
        } else {
            interval
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        {
            let registry = registry.clone();
            let app_id = app_id.clone();
            tokio::spawn(async move {
                while let Some(command) = rx.recv().await {
                    match command {
                        Command::Persist(value) => {
                            let at = chrono::Utc::now().to_rfc3339();
                            if let Err(err) =
                                registry.update_sync_progress(&app_id, &at, &value).await
                            {
                                warn!(
                                    app_id = %app_id,
                                    error = %err,
                                    "failed to persist sync progress"
                                );
                            }
                        }
                        Command::Drain(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });
        }

        Self {
            app_id,
            interval,
            state: Mutex::new(ReporterState {
                last_flush: None,
                last_value: String::new(),
            }),
            tx,
        }
    }

    /// Record the latest transcript; enqueue a persist if the flush interval
    /// elapsed. Cheap enough to call from the command output stream.
    pub fn update(&self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }

        let now = Instant::now();
        let should_flush = {
            let mut state = self.state.lock().expect("reporter lock poisoned");
            state.last_value = trimmed.to_string();
            let due = state
                .last_flush
                .map_or(true, |last| now.duration_since(last) >= self.interval);
            if due {
                state.last_flush = Some(now);
            }
            due
        };

        if should_flush {
            let _ = self.tx.send(Command::Persist(trimmed.to_string()));
        }
    }

    /// Persist the final transcript and wait for every queued write to land.
    pub async fn flush(&self) {
        let value = {
            let mut state = self.state.lock().expect("reporter lock poisoned");
            state.last_flush = Some(Instant::now());
            state.last_value.clone()
        };
        if !value.trim().is_empty() {
            let _ = self.tx.send(Command::Persist(value));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Drain(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Adapt this reporter into the executor's progress callback.
    pub fn as_progress_fn(self: &Arc<Self>) -> ProgressFn {
        let reporter = self.clone();
        Arc::new(move |value: &str| reporter.update(value))
    }

    /// The app this reporter writes for.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}
