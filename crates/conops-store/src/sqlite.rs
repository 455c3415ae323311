// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite implementation of the StateStore trait.

use async_trait::async_trait;

use conops_core::{App, AppCredential, AppStatus, ConopsError, StateStore};

use crate::database::Database;
use crate::queries;

/// SQLite-backed state store.
///
/// Wraps a [`Database`] handle and delegates all query operations to the
/// typed query modules.
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    pub async fn open(path: &str) -> Result<Self, ConopsError> {
        let db = Database::open(path).await?;
        Ok(Self { db })
    }

    /// Checkpoint the WAL ahead of shutdown.
    pub async fn close(&self) -> Result<(), ConopsError> {
        self.db.close().await
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn create_app(&self, app: &App) -> Result<(), ConopsError> {
        queries::apps::create_app(&self.db, app).await
    }

    async fn get_app(&self, id: &str) -> Result<App, ConopsError> {
        queries::apps::get_app(&self.db, id).await
    }

    async fn list_apps(&self) -> Result<Vec<App>, ConopsError> {
        queries::apps::list_apps(&self.db).await
    }

    async fn delete_app(&self, id: &str) -> Result<(), ConopsError> {
        queries::apps::delete_app(&self.db, id).await
    }

    async fn upsert_app_credential(&self, credential: &AppCredential) -> Result<(), ConopsError> {
        queries::credentials::upsert_app_credential(&self.db, credential).await
    }

    async fn get_app_credential(&self, id: &str) -> Result<AppCredential, ConopsError> {
        queries::credentials::get_app_credential(&self.db, id).await
    }

    async fn update_app_commit(
        &self,
        id: &str,
        commit_hash: &str,
        commit_message: &str,
    ) -> Result<(), ConopsError> {
        queries::apps::update_app_commit(&self.db, id, commit_hash, commit_message).await
    }

    async fn update_app_status(
        &self,
        id: &str,
        status: AppStatus,
        last_sync_at: Option<&str>,
    ) -> Result<(), ConopsError> {
        queries::apps::update_app_status(&self.db, id, status, last_sync_at).await
    }

    async fn update_app_sync_progress(
        &self,
        id: &str,
        last_sync_at: &str,
        sync_output: &str,
    ) -> Result<(), ConopsError> {
        queries::apps::update_app_sync_progress(&self.db, id, last_sync_at, sync_output).await
    }

    async fn update_app_sync_result(
        &self,
        id: &str,
        status: AppStatus,
        last_sync_at: &str,
        synced_commit: &str,
        synced_commit_message: &str,
        sync_output: &str,
        sync_error: &str,
    ) -> Result<(), ConopsError> {
        queries::apps::update_app_sync_result(
            &self.db,
            id,
            status,
            last_sync_at,
            synced_commit,
            synced_commit_message,
            sync_output,
            sync_error,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conops_core::RepoAuthMethod;
    use tempfile::tempdir;

    fn make_app(id: &str) -> App {
        App {
            id: id.to_string(),
            name: "demo".to_string(),
            repo_url: "https://example.com/acme/site.git".to_string(),
            repo_auth_method: RepoAuthMethod::Public,
            branch: "main".to_string(),
            compose_path: "compose.yaml".to_string(),
            poll_interval: "30s".to_string(),
            last_seen_commit: String::new(),
            last_seen_commit_message: String::new(),
            last_synced_commit: String::new(),
            last_synced_commit_message: String::new(),
            last_sync_output: String::new(),
            last_sync_error: String::new(),
            last_sync_at: String::new(),
            status: AppStatus::Pending,
        }
    }

    #[tokio::test]
    async fn full_lifecycle_through_the_trait() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let store = SqliteStore::open(db_path.to_str().unwrap()).await.unwrap();
        let store: &dyn StateStore = &store;

        store.create_app(&make_app("a-1")).await.unwrap();
        assert_eq!(store.list_apps().await.unwrap().len(), 1);

        store
            .update_app_commit("a-1", "abc123", "feat: first")
            .await
            .unwrap();
        let app = store.get_app("a-1").await.unwrap();
        assert_eq!(app.last_seen_commit, "abc123");
        assert_eq!(app.status, AppStatus::Pending);

        store
            .update_app_status("a-1", AppStatus::Syncing, Some("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        let app = store.get_app("a-1").await.unwrap();
        assert_eq!(app.status, AppStatus::Syncing);
        assert_eq!(app.last_sync_at, "2026-01-01T00:00:00Z");

        store
            .update_app_sync_result(
                "a-1",
                AppStatus::Synced,
                "2026-01-01T00:01:00Z",
                "abc123",
                "feat: first",
                "transcript",
                "",
            )
            .await
            .unwrap();
        let app = store.get_app("a-1").await.unwrap();
        assert_eq!(app.status, AppStatus::Synced);
        assert_eq!(app.last_synced_commit, "abc123");

        store.delete_app("a-1").await.unwrap();
        assert!(store.get_app("a-1").await.is_err());
    }

    #[tokio::test]
    async fn failed_apply_preserves_prior_synced_commit() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let store = SqliteStore::open(db_path.to_str().unwrap()).await.unwrap();

        store.create_app(&make_app("a-1")).await.unwrap();
        store
            .update_app_sync_result(
                "a-1",
                AppStatus::Synced,
                "2026-01-01T00:00:00Z",
                "abc123",
                "feat: first",
                "ok",
                "",
            )
            .await
            .unwrap();

        // The caller passes the previous synced commit on failure; the store
        // writes exactly what it is given.
        store
            .update_app_sync_result(
                "a-1",
                AppStatus::Error,
                "2026-01-01T00:02:00Z",
                "abc123",
                "feat: first",
                "failing transcript",
                "up failed",
            )
            .await
            .unwrap();

        let app = store.get_app("a-1").await.unwrap();
        assert_eq!(app.status, AppStatus::Error);
        assert_eq!(app.last_synced_commit, "abc123");
        assert_eq!(app.last_sync_error, "up failed");
    }
}
