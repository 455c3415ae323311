// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The control loops: Git watcher (desired state) and reconciler (applied
//! state), plus the throttled sync-progress reporter they share with the
//! HTTP force-sync path.

pub mod progress;
pub mod reconciler;
pub mod watcher;

pub use progress::{SyncProgressReporter, SYNC_PROGRESS_FLUSH_INTERVAL};
pub use reconciler::{runtime_drift_reason, Reconciler, ReconcilerSettings};
pub use watcher::GitWatcher;
