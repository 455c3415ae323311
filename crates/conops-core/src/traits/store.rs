// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The persistent state store contract.
//!
//! The store is the single source of truth: watchers only write *desired*
//! state, the reconciler and force-sync only write *applied* state, and every
//! actor observes transitions through these operations. Mutating operations
//! must fail with [`ConopsError::NotFound`] when zero rows were affected so
//! callers can treat a lost race as such.

use async_trait::async_trait;

use crate::error::ConopsError;
use crate::types::{App, AppCredential, AppStatus};

/// Durable persistence of apps and their encrypted credentials.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new app row. Uniqueness on `id`; duplicates fail with
    /// [`ConopsError::Conflict`].
    async fn create_app(&self, app: &App) -> Result<(), ConopsError>;

    /// Fetch one app by id, NULLs coalesced to empty strings.
    async fn get_app(&self, id: &str) -> Result<App, ConopsError>;

    /// List all apps.
    async fn list_apps(&self) -> Result<Vec<App>, ConopsError>;

    /// Transactionally delete the credentials row then the app row. Fails
    /// with `NotFound` when the app row is missing.
    async fn delete_app(&self, id: &str) -> Result<(), ConopsError>;

    /// Idempotent upsert keyed by `app_id`.
    async fn upsert_app_credential(&self, credential: &AppCredential) -> Result<(), ConopsError>;

    /// Fetch the credentials row, failing with `NotFound` (not a generic
    /// error) when absent.
    async fn get_app_credential(&self, id: &str) -> Result<AppCredential, ConopsError>;

    /// Atomically record a newly observed desired commit AND force the app
    /// back to `pending`.
    async fn update_app_commit(
        &self,
        id: &str,
        commit_hash: &str,
        commit_message: &str,
    ) -> Result<(), ConopsError>;

    /// Status-only transition, optionally stamping `last_sync_at`.
    async fn update_app_status(
        &self,
        id: &str,
        status: AppStatus,
        last_sync_at: Option<&str>,
    ) -> Result<(), ConopsError>;

    /// Bulk-write the in-flight transcript: sets `status = syncing`, clears
    /// `last_sync_error`.
    async fn update_app_sync_progress(
        &self,
        id: &str,
        last_sync_at: &str,
        sync_output: &str,
    ) -> Result<(), ConopsError>;

    /// Terminal write after an apply completes or fails.
    #[allow(clippy::too_many_arguments)]
    async fn update_app_sync_result(
        &self,
        id: &str,
        status: AppStatus,
        last_sync_at: &str,
        synced_commit: &str,
        synced_commit_message: &str,
        sync_output: &str,
        sync_error: &str,
    ) -> Result<(), ConopsError>;
}
