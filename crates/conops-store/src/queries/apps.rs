// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! App row CRUD and status-machine writes.
//!
//! Mutations report `NotFound` when zero rows were affected so callers can
//! distinguish a lost race from success. Read paths coalesce NULLs to empty
//! strings.

use std::str::FromStr;

use conops_core::{App, AppStatus, ConopsError, RepoAuthMethod};
use rusqlite::{params, Row};

use crate::database::{map_tr_err, Database};

const APP_COLUMNS: &str = "id,
    name,
    repo_url,
    repo_auth_method,
    branch,
    compose_path,
    poll_interval,
    COALESCE(last_seen_commit, ''),
    COALESCE(last_seen_commit_message, ''),
    COALESCE(last_synced_commit, ''),
    COALESCE(last_synced_commit_message, ''),
    COALESCE(last_sync_output, ''),
    COALESCE(last_sync_error, ''),
    COALESCE(last_sync_at, ''),
    status";

fn row_to_app(row: &Row<'_>) -> Result<App, rusqlite::Error> {
    let method_raw: String = row.get(3)?;
    let repo_auth_method = RepoAuthMethod::from_str(&method_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_raw: String = row.get(14)?;
    let status = AppStatus::from_str(&status_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_url: row.get(2)?,
        repo_auth_method,
        branch: row.get(4)?,
        compose_path: row.get(5)?,
        poll_interval: row.get(6)?,
        last_seen_commit: row.get(7)?,
        last_seen_commit_message: row.get(8)?,
        last_synced_commit: row.get(9)?,
        last_synced_commit_message: row.get(10)?,
        last_sync_output: row.get(11)?,
        last_sync_error: row.get(12)?,
        last_sync_at: row.get(13)?,
        status,
    })
}

/// Insert a new app row. Duplicate ids fail with `Conflict`.
pub async fn create_app(db: &Database, app: &App) -> Result<(), ConopsError> {
    let app = app.clone();
    let inserted = db
        .connection()
        .call(move |conn| -> Result<bool, tokio_rusqlite::Error> {
            let result = conn.execute(
                "INSERT INTO apps (
                    id, name, repo_url, repo_auth_method, branch, compose_path,
                    poll_interval, last_seen_commit, last_seen_commit_message,
                    last_synced_commit, last_synced_commit_message,
                    last_sync_output, last_sync_error, last_sync_at, status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    app.id,
                    app.name,
                    app.repo_url,
                    app.repo_auth_method.to_string(),
                    app.branch,
                    app.compose_path,
                    app.poll_interval,
                    app.last_seen_commit,
                    app.last_seen_commit_message,
                    app.last_synced_commit,
                    app.last_synced_commit_message,
                    app.last_sync_output,
                    app.last_sync_error,
                    app.last_sync_at,
                    app.status.to_string(),
                ],
            );
            match result {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(tokio_rusqlite::Error::Rusqlite(e)),
            }
        })
        .await
        .map_err(map_tr_err)?;

    if !inserted {
        return Err(ConopsError::Conflict("app already exists".to_string()));
    }
    Ok(())
}

/// Fetch one app by id.
pub async fn get_app(db: &Database, id: &str) -> Result<App, ConopsError> {
    let id = id.to_string();
    let app = db
        .connection()
        .call(move |conn| -> Result<Option<App>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(&format!(
                "SELECT {APP_COLUMNS} FROM apps WHERE id = ?1"
            ))?;
            match stmt.query_row(params![id], row_to_app) {
                Ok(app) => Ok(Some(app)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(tokio_rusqlite::Error::Rusqlite(e)),
            }
        })
        .await
        .map_err(map_tr_err)?;

    app.ok_or_else(|| ConopsError::NotFound("app not found".to_string()))
}

/// List all apps.
pub async fn list_apps(db: &Database) -> Result<Vec<App>, ConopsError> {
    db.connection()
        .call(|conn| -> Result<Vec<App>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(&format!("SELECT {APP_COLUMNS} FROM apps"))?;
            let rows = stmt.query_map([], row_to_app)?;
            let mut apps = Vec::new();
            for row in rows {
                apps.push(row?);
            }
            Ok(apps)
        })
        .await
        .map_err(map_tr_err)
}

/// Transactionally delete credentials then the app row.
pub async fn delete_app(db: &Database, id: &str) -> Result<(), ConopsError> {
    let id = id.to_string();
    let deleted = db
        .connection()
        .call(move |conn| -> Result<bool, tokio_rusqlite::Error> {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM app_credentials WHERE app_id = ?1",
                params![id],
            )?;
            let affected = tx.execute("DELETE FROM apps WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(affected > 0)
        })
        .await
        .map_err(map_tr_err)?;

    if !deleted {
        return Err(ConopsError::NotFound("app not found".to_string()));
    }
    Ok(())
}

/// Atomically record the desired commit AND force `status = pending`.
pub async fn update_app_commit(
    db: &Database,
    id: &str,
    commit_hash: &str,
    commit_message: &str,
) -> Result<(), ConopsError> {
    let id = id.to_string();
    let commit_hash = commit_hash.to_string();
    let commit_message = commit_message.to_string();
    let affected = db
        .connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE apps
                 SET last_seen_commit = ?1, last_seen_commit_message = ?2, status = ?3
                 WHERE id = ?4",
                params![
                    commit_hash,
                    commit_message,
                    AppStatus::Pending.to_string(),
                    id
                ],
            )
            .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(map_tr_err)?;

    if affected == 0 {
        return Err(ConopsError::NotFound("app not found".to_string()));
    }
    Ok(())
}

/// Status-only transition, optionally stamping `last_sync_at`.
pub async fn update_app_status(
    db: &Database,
    id: &str,
    status: AppStatus,
    last_sync_at: Option<&str>,
) -> Result<(), ConopsError> {
    let id = id.to_string();
    let status = status.to_string();
    let last_sync_at = last_sync_at.map(|s| s.to_string());
    let affected = db
        .connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            match last_sync_at {
                Some(at) => conn.execute(
                    "UPDATE apps SET status = ?1, last_sync_at = ?2 WHERE id = ?3",
                    params![status, at, id],
                ),
                None => conn.execute(
                    "UPDATE apps SET status = ?1 WHERE id = ?2",
                    params![status, id],
                ),
            }
            .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(map_tr_err)?;

    if affected == 0 {
        return Err(ConopsError::NotFound("app not found".to_string()));
    }
    Ok(())
}

/// Bulk-write the in-flight transcript; forces `status = syncing` and clears
/// any stale error.
pub async fn update_app_sync_progress(
    db: &Database,
    id: &str,
    last_sync_at: &str,
    sync_output: &str,
) -> Result<(), ConopsError> {
    let id = id.to_string();
    let last_sync_at = last_sync_at.to_string();
    let sync_output = sync_output.to_string();
    let affected = db
        .connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE apps
                 SET status = ?1, last_sync_at = ?2, last_sync_output = ?3, last_sync_error = ''
                 WHERE id = ?4",
                params![AppStatus::Syncing.to_string(), last_sync_at, sync_output, id],
            )
            .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(map_tr_err)?;

    if affected == 0 {
        return Err(ConopsError::NotFound("app not found".to_string()));
    }
    Ok(())
}

/// Terminal write after an apply completes or fails.
#[allow(clippy::too_many_arguments)]
pub async fn update_app_sync_result(
    db: &Database,
    id: &str,
    status: AppStatus,
    last_sync_at: &str,
    synced_commit: &str,
    synced_commit_message: &str,
    sync_output: &str,
    sync_error: &str,
) -> Result<(), ConopsError> {
    let id = id.to_string();
    let status = status.to_string();
    let last_sync_at = last_sync_at.to_string();
    let synced_commit = synced_commit.to_string();
    let synced_commit_message = synced_commit_message.to_string();
    let sync_output = sync_output.to_string();
    let sync_error = sync_error.to_string();
    let affected = db
        .connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            conn.execute(
                "UPDATE apps
                 SET status = ?1,
                     last_sync_at = ?2,
                     last_synced_commit = ?3,
                     last_synced_commit_message = ?4,
                     last_sync_output = ?5,
                     last_sync_error = ?6
                 WHERE id = ?7",
                params![
                    status,
                    last_sync_at,
                    synced_commit,
                    synced_commit_message,
                    sync_output,
                    sync_error,
                    id
                ],
            )
            .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(map_tr_err)?;

    if affected == 0 {
        return Err(ConopsError::NotFound("app not found".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("apps.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

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
    async fn create_and_get_roundtrips() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();

        let app = get_app(&db, "a-1").await.unwrap();
        assert_eq!(app.name, "demo");
        assert_eq!(app.status, AppStatus::Pending);
        assert_eq!(app.repo_auth_method, RepoAuthMethod::Public);
        assert_eq!(app.last_sync_at, "");
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();
        let err = create_app(&db, &make_app("a-1")).await.unwrap_err();
        assert!(matches!(err, ConopsError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_unknown_app_is_not_found() {
        let (db, _dir) = setup_db().await;
        let err = get_app(&db, "nope").await.unwrap_err();
        assert!(matches!(err, ConopsError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_commit_sets_status_pending_atomically() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();
        update_app_status(&db, "a-1", AppStatus::Synced, None)
            .await
            .unwrap();

        update_app_commit(&db, "a-1", "abc123", "feat: ship it")
            .await
            .unwrap();

        let app = get_app(&db, "a-1").await.unwrap();
        assert_eq!(app.last_seen_commit, "abc123");
        assert_eq!(app.last_seen_commit_message, "feat: ship it");
        assert_eq!(app.status, AppStatus::Pending);
    }

    #[tokio::test]
    async fn mutations_on_unknown_apps_report_not_found() {
        let (db, _dir) = setup_db().await;
        assert!(matches!(
            update_app_commit(&db, "ghost", "abc", "m").await.unwrap_err(),
            ConopsError::NotFound(_)
        ));
        assert!(matches!(
            update_app_status(&db, "ghost", AppStatus::Pending, None)
                .await
                .unwrap_err(),
            ConopsError::NotFound(_)
        ));
        assert!(matches!(
            update_app_sync_progress(&db, "ghost", "2026-01-01T00:00:00Z", "log")
                .await
                .unwrap_err(),
            ConopsError::NotFound(_)
        ));
        assert!(matches!(
            delete_app(&db, "ghost").await.unwrap_err(),
            ConopsError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn sync_progress_forces_syncing_and_clears_error() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();
        update_app_sync_result(
            &db,
            "a-1",
            AppStatus::Error,
            "2026-01-01T00:00:00Z",
            "",
            "",
            "old output",
            "pull failed",
        )
        .await
        .unwrap();

        update_app_sync_progress(&db, "a-1", "2026-01-01T00:01:00Z", "$ git fetch origin")
            .await
            .unwrap();

        let app = get_app(&db, "a-1").await.unwrap();
        assert_eq!(app.status, AppStatus::Syncing);
        assert_eq!(app.last_sync_error, "");
        assert_eq!(app.last_sync_output, "$ git fetch origin");
        assert_eq!(app.last_sync_at, "2026-01-01T00:01:00Z");
    }

    #[tokio::test]
    async fn sync_result_writes_all_terminal_fields() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();

        update_app_sync_result(
            &db,
            "a-1",
            AppStatus::Synced,
            "2026-01-01T00:00:00Z",
            "abc123",
            "feat: ship it",
            "transcript",
            "",
        )
        .await
        .unwrap();

        let app = get_app(&db, "a-1").await.unwrap();
        assert_eq!(app.status, AppStatus::Synced);
        assert_eq!(app.last_synced_commit, "abc123");
        assert_eq!(app.last_synced_commit_message, "feat: ship it");
        assert_eq!(app.last_sync_output, "transcript");
        assert_eq!(app.last_sync_error, "");
    }

    #[tokio::test]
    async fn list_returns_all_apps() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();
        create_app(&db, &make_app("a-2")).await.unwrap();
        let apps = list_apps(&db).await.unwrap();
        assert_eq!(apps.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (db, _dir) = setup_db().await;
        create_app(&db, &make_app("a-1")).await.unwrap();
        delete_app(&db, "a-1").await.unwrap();
        assert!(matches!(
            get_app(&db, "a-1").await.unwrap_err(),
            ConopsError::NotFound(_)
        ));
    }
}
