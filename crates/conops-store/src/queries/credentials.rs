// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted deploy-key credential rows.

use conops_core::{AppCredential, ConopsError};
use rusqlite::params;

use crate::database::{map_tr_err, Database};

/// Idempotent upsert keyed by `app_id`.
pub async fn upsert_app_credential(
    db: &Database,
    credential: &AppCredential,
) -> Result<(), ConopsError> {
    let credential = credential.clone();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO app_credentials (app_id, deploy_key_ciphertext, deploy_key_nonce)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(app_id) DO UPDATE SET
                     deploy_key_ciphertext = excluded.deploy_key_ciphertext,
                     deploy_key_nonce = excluded.deploy_key_nonce",
                params![
                    credential.app_id,
                    credential.deploy_key_ciphertext,
                    credential.deploy_key_nonce
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Fetch the credentials row, failing with `NotFound` when absent.
pub async fn get_app_credential(db: &Database, id: &str) -> Result<AppCredential, ConopsError> {
    let id = id.to_string();
    let credential = db
        .connection()
        .call(move |conn| -> Result<Option<AppCredential>, tokio_rusqlite::Error> {
            let mut stmt = conn.prepare(
                "SELECT app_id, deploy_key_ciphertext, deploy_key_nonce
                 FROM app_credentials WHERE app_id = ?1",
            )?;
            let result = stmt.query_row(params![id], |row| {
                Ok(AppCredential {
                    app_id: row.get(0)?,
                    deploy_key_ciphertext: row.get(1)?,
                    deploy_key_nonce: row.get(2)?,
                })
            });
            match result {
                Ok(credential) => Ok(Some(credential)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(tokio_rusqlite::Error::Rusqlite(e)),
            }
        })
        .await
        .map_err(map_tr_err)?;

    credential.ok_or_else(|| ConopsError::NotFound("app credential not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::apps;
    use conops_core::{App, AppStatus, RepoAuthMethod};
    use tempfile::tempdir;

    async fn setup_db_with_app(id: &str) -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("creds.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        let app = App {
            id: id.to_string(),
            name: "demo".to_string(),
            repo_url: "git@github.com:acme/site.git".to_string(),
            repo_auth_method: RepoAuthMethod::DeployKey,
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
        };
        apps::create_app(&db, &app).await.unwrap();
        (db, dir)
    }

    fn make_credential(app_id: &str, fill: u8) -> AppCredential {
        AppCredential {
            app_id: app_id.to_string(),
            deploy_key_ciphertext: vec![fill; 48],
            deploy_key_nonce: vec![fill; 12],
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let (db, _dir) = setup_db_with_app("a-1").await;
        upsert_app_credential(&db, &make_credential("a-1", 1))
            .await
            .unwrap();

        let credential = get_app_credential(&db, "a-1").await.unwrap();
        assert_eq!(credential.deploy_key_ciphertext, vec![1u8; 48]);
        assert_eq!(credential.deploy_key_nonce, vec![1u8; 12]);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_overwrites() {
        let (db, _dir) = setup_db_with_app("a-1").await;
        upsert_app_credential(&db, &make_credential("a-1", 1))
            .await
            .unwrap();
        upsert_app_credential(&db, &make_credential("a-1", 2))
            .await
            .unwrap();

        let credential = get_app_credential(&db, "a-1").await.unwrap();
        assert_eq!(credential.deploy_key_ciphertext, vec![2u8; 48]);
    }

    #[tokio::test]
    async fn missing_credential_is_not_found_sentinel() {
        let (db, _dir) = setup_db_with_app("a-1").await;
        let err = get_app_credential(&db, "a-1").await.unwrap_err();
        assert!(matches!(err, ConopsError::NotFound(_)));
    }

    #[tokio::test]
    async fn deleting_the_app_cascades_to_credentials() {
        let (db, _dir) = setup_db_with_app("a-1").await;
        upsert_app_credential(&db, &make_credential("a-1", 1))
            .await
            .unwrap();

        apps::delete_app(&db, "a-1").await.unwrap();

        let err = get_app_credential(&db, "a-1").await.unwrap_err();
        assert!(matches!(err, ConopsError::NotFound(_)));
    }
}
