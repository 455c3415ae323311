// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All access is serialized through tokio-rusqlite's single background
//! thread. Migrations run on a short-lived blocking connection before the
//! async connection opens, so a process never serves queries against an
//! unmigrated schema.

use conops_core::ConopsError;
use tracing::debug;

use crate::migrations;

/// An open, migrated SQLite database handle.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open (creating if needed) and migrate the database at `path`.
    pub async fn open(path: &str) -> Result<Self, ConopsError> {
        let migrate_path = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), ConopsError> {
            let mut conn = rusqlite::Connection::open(&migrate_path).map_err(map_sql_err)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
            )
            .map_err(map_sql_err)?;
            migrations::run_migrations(&mut conn)
        })
        .await
        .map_err(|err| ConopsError::Internal(format!("migration task panicked: {err}")))??;

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(map_tr_err)?;

        // Foreign-key enforcement is per-connection; re-enable it on the
        // long-lived async connection.
        conn.call(|conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        debug!(path = %path, "database opened");
        Ok(Self { conn })
    }

    /// The underlying serialized connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Checkpoint the WAL ahead of shutdown.
    pub async fn close(&self) -> Result<(), ConopsError> {
        self.conn
            .call(|conn| -> Result<(), tokio_rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

/// Convert tokio-rusqlite transport errors to [`ConopsError::Storage`].
pub(crate) fn map_tr_err(e: tokio_rusqlite::Error) -> ConopsError {
    ConopsError::Storage {
        source: Box::new(e),
    }
}

/// Convert plain rusqlite errors to [`ConopsError::Storage`].
pub(crate) fn map_sql_err(e: rusqlite::Error) -> ConopsError {
    ConopsError::Storage {
        source: Box::new(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_and_migrates_the_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("open.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());

        // Both tables exist after migrations.
        let tables: Vec<String> = db
            .connection()
            .call(|conn| -> Result<Vec<String>, tokio_rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row?);
                }
                Ok(names)
            })
            .await
            .unwrap();
        assert!(tables.contains(&"apps".to_string()));
        assert!(tables.contains(&"app_credentials".to_string()));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_is_idempotent_across_restarts() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("reopen.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        db.close().await.unwrap();
        drop(db);

        // Second open re-runs the (already applied) migrations cleanly.
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        db.close().await.unwrap();
    }
}
