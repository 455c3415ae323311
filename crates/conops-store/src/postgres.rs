// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! PostgreSQL implementation of the StateStore trait.
//!
//! Schema setup is idempotent: `CREATE TABLE IF NOT EXISTS` plus
//! `ADD COLUMN IF NOT EXISTS` with non-null defaults, so databases written by
//! older binaries upgrade in place on startup.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use conops_core::{App, AppCredential, AppStatus, ConopsError, RepoAuthMethod, StateStore};

const APP_COLUMNS: &str = "id,
    name,
    repo_url,
    repo_auth_method,
    branch,
    compose_path,
    poll_interval,
    COALESCE(last_seen_commit, '') AS last_seen_commit,
    COALESCE(last_seen_commit_message, '') AS last_seen_commit_message,
    COALESCE(last_synced_commit, '') AS last_synced_commit,
    COALESCE(last_synced_commit_message, '') AS last_synced_commit_message,
    COALESCE(last_sync_output, '') AS last_sync_output,
    COALESCE(last_sync_error, '') AS last_sync_error,
    COALESCE(last_sync_at, '') AS last_sync_at,
    status";

/// PostgreSQL-backed state store for multi-process production deployments.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run the idempotent schema setup.
    pub async fn connect(connection_string: &str) -> Result<Self, ConopsError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .map_err(map_err)?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), ConopsError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS apps (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                repo_url TEXT NOT NULL DEFAULT '',
                repo_auth_method TEXT NOT NULL DEFAULT 'public',
                branch TEXT NOT NULL DEFAULT 'main',
                compose_path TEXT NOT NULL DEFAULT 'compose.yaml',
                poll_interval TEXT NOT NULL DEFAULT '30s',
                last_seen_commit TEXT NOT NULL DEFAULT '',
                last_sync_at TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending'
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        for column in [
            "last_seen_commit_message",
            "last_synced_commit",
            "last_synced_commit_message",
            "last_sync_output",
            "last_sync_error",
        ] {
            sqlx::query(&format!(
                "ALTER TABLE apps ADD COLUMN IF NOT EXISTS {column} TEXT NOT NULL DEFAULT ''"
            ))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS app_credentials (
                app_id TEXT PRIMARY KEY REFERENCES apps(id) ON DELETE CASCADE,
                deploy_key_ciphertext BYTEA NOT NULL,
                deploy_key_nonce BYTEA NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(())
    }
}

fn map_err(e: sqlx::Error) -> ConopsError {
    ConopsError::Storage {
        source: Box::new(e),
    }
}

fn row_to_app(row: &sqlx::postgres::PgRow) -> Result<App, ConopsError> {
    let method_raw: String = row.try_get("repo_auth_method").map_err(map_err)?;
    let status_raw: String = row.try_get("status").map_err(map_err)?;
    Ok(App {
        id: row.try_get("id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        repo_url: row.try_get("repo_url").map_err(map_err)?,
        repo_auth_method: RepoAuthMethod::from_str(&method_raw)
            .map_err(|e| ConopsError::Internal(format!("corrupt repo_auth_method: {e}")))?,
        branch: row.try_get("branch").map_err(map_err)?,
        compose_path: row.try_get("compose_path").map_err(map_err)?,
        poll_interval: row.try_get("poll_interval").map_err(map_err)?,
        last_seen_commit: row.try_get("last_seen_commit").map_err(map_err)?,
        last_seen_commit_message: row.try_get("last_seen_commit_message").map_err(map_err)?,
        last_synced_commit: row.try_get("last_synced_commit").map_err(map_err)?,
        last_synced_commit_message: row
            .try_get("last_synced_commit_message")
            .map_err(map_err)?,
        last_sync_output: row.try_get("last_sync_output").map_err(map_err)?,
        last_sync_error: row.try_get("last_sync_error").map_err(map_err)?,
        last_sync_at: row.try_get("last_sync_at").map_err(map_err)?,
        status: AppStatus::from_str(&status_raw)
            .map_err(|e| ConopsError::Internal(format!("corrupt status: {e}")))?,
    })
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn create_app(&self, app: &App) -> Result<(), ConopsError> {
        let result = sqlx::query(
            "INSERT INTO apps (
                id, name, repo_url, repo_auth_method, branch, compose_path,
                poll_interval, last_seen_commit, last_seen_commit_message,
                last_synced_commit, last_synced_commit_message,
                last_sync_output, last_sync_error, last_sync_at, status
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&app.id)
        .bind(&app.name)
        .bind(&app.repo_url)
        .bind(app.repo_auth_method.to_string())
        .bind(&app.branch)
        .bind(&app.compose_path)
        .bind(&app.poll_interval)
        .bind(&app.last_seen_commit)
        .bind(&app.last_seen_commit_message)
        .bind(&app.last_synced_commit)
        .bind(&app.last_synced_commit_message)
        .bind(&app.last_sync_output)
        .bind(&app.last_sync_error)
        .bind(&app.last_sync_at)
        .bind(app.status.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ConopsError::Conflict("app already exists".to_string()))
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn get_app(&self, id: &str) -> Result<App, ConopsError> {
        let row = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| ConopsError::NotFound("app not found".to_string()))?;
        row_to_app(&row)
    }

    async fn list_apps(&self) -> Result<Vec<App>, ConopsError> {
        let rows = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(row_to_app).collect()
    }

    async fn delete_app(&self, id: &str) -> Result<(), ConopsError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("DELETE FROM app_credentials WHERE app_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        let result = sqlx::query("DELETE FROM apps WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(ConopsError::NotFound("app not found".to_string()));
        }
        tx.commit().await.map_err(map_err)
    }

    async fn upsert_app_credential(&self, credential: &AppCredential) -> Result<(), ConopsError> {
        sqlx::query(
            "INSERT INTO app_credentials (app_id, deploy_key_ciphertext, deploy_key_nonce)
             VALUES ($1, $2, $3)
             ON CONFLICT (app_id) DO UPDATE SET
                 deploy_key_ciphertext = EXCLUDED.deploy_key_ciphertext,
                 deploy_key_nonce = EXCLUDED.deploy_key_nonce",
        )
        .bind(&credential.app_id)
        .bind(&credential.deploy_key_ciphertext)
        .bind(&credential.deploy_key_nonce)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_app_credential(&self, id: &str) -> Result<AppCredential, ConopsError> {
        let row = sqlx::query(
            "SELECT app_id, deploy_key_ciphertext, deploy_key_nonce
             FROM app_credentials WHERE app_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .ok_or_else(|| ConopsError::NotFound("app credential not found".to_string()))?;

        Ok(AppCredential {
            app_id: row.try_get("app_id").map_err(map_err)?,
            deploy_key_ciphertext: row.try_get("deploy_key_ciphertext").map_err(map_err)?,
            deploy_key_nonce: row.try_get("deploy_key_nonce").map_err(map_err)?,
        })
    }

    async fn update_app_commit(
        &self,
        id: &str,
        commit_hash: &str,
        commit_message: &str,
    ) -> Result<(), ConopsError> {
        let result = sqlx::query(
            "UPDATE apps
             SET last_seen_commit = $1, last_seen_commit_message = $2, status = $3
             WHERE id = $4",
        )
        .bind(commit_hash)
        .bind(commit_message)
        .bind(AppStatus::Pending.to_string())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(ConopsError::NotFound("app not found".to_string()));
        }
        Ok(())
    }

    async fn update_app_status(
        &self,
        id: &str,
        status: AppStatus,
        last_sync_at: Option<&str>,
    ) -> Result<(), ConopsError> {
        let result = match last_sync_at {
            Some(at) => {
                sqlx::query("UPDATE apps SET status = $1, last_sync_at = $2 WHERE id = $3")
                    .bind(status.to_string())
                    .bind(at)
                    .bind(id)
                    .execute(&self.pool)
                    .await
            }
            None => {
                sqlx::query("UPDATE apps SET status = $1 WHERE id = $2")
                    .bind(status.to_string())
                    .bind(id)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(ConopsError::NotFound("app not found".to_string()));
        }
        Ok(())
    }

    async fn update_app_sync_progress(
        &self,
        id: &str,
        last_sync_at: &str,
        sync_output: &str,
    ) -> Result<(), ConopsError> {
        let result = sqlx::query(
            "UPDATE apps
             SET status = $1, last_sync_at = $2, last_sync_output = $3, last_sync_error = ''
             WHERE id = $4",
        )
        .bind(AppStatus::Syncing.to_string())
        .bind(last_sync_at)
        .bind(sync_output)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(ConopsError::NotFound("app not found".to_string()));
        }
        Ok(())
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
        let result = sqlx::query(
            "UPDATE apps
             SET status = $1,
                 last_sync_at = $2,
                 last_synced_commit = $3,
                 last_synced_commit_message = $4,
                 last_sync_output = $5,
                 last_sync_error = $6
             WHERE id = $7",
        )
        .bind(status.to_string())
        .bind(last_sync_at)
        .bind(synced_commit)
        .bind(synced_commit_message)
        .bind(sync_output)
        .bind(sync_error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(ConopsError::NotFound("app not found".to_string()));
        }
        Ok(())
    }
}
