// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedded database migrations using refinery.
//!
//! SQL migration files are compiled into the binary at build time via
//! `embed_migrations!`. The baseline migration creates the tables; later
//! migrations are additive columns with non-null defaults so rows written by
//! older binaries read cleanly.

use conops_core::ConopsError;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Run all pending migrations against the given connection.
///
/// Refinery tracks applied migrations in its own `refinery_schema_history`
/// table, so reruns are no-ops.
pub fn run_migrations(conn: &mut rusqlite::Connection) -> Result<(), ConopsError> {
    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| ConopsError::Storage {
            source: Box::new(e),
        })?;
    Ok(())
}
