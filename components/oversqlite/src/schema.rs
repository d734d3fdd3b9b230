/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Sync metadata schema
//! ====================
//!
//! Three tables, all owned by the engine:
//!
//! - `sync_client_info`: a single row identifying this install and holding
//!   the change-id counter, the download cursor, the apply-mode flag and the
//!   frozen hydration window.
//!
//! - `sync_row_meta`: one row per synced (table, pk) recording the last
//!   server version observed for that row and its tombstone flag.
//!
//! - `sync_pending`: the outbound queue; at most one row per (table, pk),
//!   maintained by the capture triggers. `payload` is the JSON image of the
//!   row for INSERT/UPDATE and NULL for DELETE. `change_id` is assigned
//!   lazily when the row is first uploaded.
//!
//! Business tables are owned by the application and only ever touched here
//! while `apply_mode` is 1 (capture triggers inert).

use rusqlite::{Connection, Transaction};
use sql_support::{
    open_database::{
        ConnectionInitializer, Error as OpenError, Result as OpenResult,
    },
    ConnExt,
};

const CREATE_CLIENT_INFO_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_client_info (
        user_id               TEXT NOT NULL UNIQUE,
        source_id             TEXT NOT NULL,
        next_change_id        INTEGER NOT NULL DEFAULT 1,
        last_server_seq_seen  INTEGER NOT NULL DEFAULT 0,
        apply_mode            INTEGER NOT NULL DEFAULT 0,
        current_window_until  INTEGER NOT NULL DEFAULT 0
    )
";

const CREATE_ROW_META_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_row_meta (
        table_name      TEXT NOT NULL,
        pk_uuid         TEXT NOT NULL,
        server_version  INTEGER NOT NULL DEFAULT 0,
        deleted         INTEGER NOT NULL DEFAULT 0,
        updated_at      TEXT NOT NULL,
        PRIMARY KEY (table_name, pk_uuid)
    )
";

const CREATE_PENDING_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_pending (
        table_name      TEXT NOT NULL,
        pk_uuid         TEXT NOT NULL,
        op              TEXT NOT NULL CHECK (op IN ('INSERT', 'UPDATE', 'DELETE')),
        base_version    INTEGER NOT NULL DEFAULT 0,
        payload         TEXT,
        change_id       INTEGER,
        queued_at       TEXT NOT NULL,
        PRIMARY KEY (table_name, pk_uuid)
    )
";

// Upload order is queue order.
const CREATE_PENDING_QUEUED_INDEX_SQL: &str = "
    CREATE INDEX IF NOT EXISTS idx_sync_pending_queued_at
    ON sync_pending (queued_at)
";

pub struct SyncConnectionInitializer;

impl ConnectionInitializer for SyncConnectionInitializer {
    const NAME: &'static str = "oversqlite db";
    const END_VERSION: u32 = 1;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> OpenResult<()> {
        let initial_pragmas = "
            -- Keep temp tables in memory; nothing here is worth spilling.
            PRAGMA temp_store = 2;
            PRAGMA journal_mode = WAL;
            -- The business tables may rely on these.
            PRAGMA foreign_keys = ON;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, db: &Transaction<'_>) -> OpenResult<()> {
        log::debug!("Creating sync metadata schema");
        db.execute_all(&[
            CREATE_CLIENT_INFO_SQL,
            CREATE_ROW_META_SQL,
            CREATE_PENDING_SQL,
            CREATE_PENDING_QUEUED_INDEX_SQL,
        ])?;
        Ok(())
    }

    fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> OpenResult<()> {
        Err(OpenError::IncompatibleVersion(version))
    }
}

/// Idempotent re-create, used by bootstrap: the business database may exist
/// (with a nonzero user_version of its own) before we ever run, so bootstrap
/// can't rely on the versioned-open path having created our tables.
pub(crate) fn ensure_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_all(&[
        CREATE_CLIENT_INFO_SQL,
        CREATE_ROW_META_SQL,
        CREATE_PENDING_SQL,
        CREATE_PENDING_QUEUED_INDEX_SQL,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_support::open_database::open_memory_database;

    #[test]
    fn test_create_schema_twice() {
        let conn = open_memory_database(&SyncConnectionInitializer).unwrap();
        ensure_tables(&conn).expect("should allow running twice");
        assert_eq!(
            conn.query_one::<u32>("PRAGMA user_version").unwrap(),
            SyncConnectionInitializer::END_VERSION
        );
    }

    #[test]
    fn test_empty_defaults() {
        let conn = open_memory_database(&SyncConnectionInitializer).unwrap();
        conn.execute(
            "INSERT INTO sync_client_info (user_id, source_id) VALUES ('u', 's')",
            [],
        )
        .unwrap();
        let (next_change_id, last_seen, apply_mode): (i64, i64, i64) = conn
            .query_row(
                "SELECT next_change_id, last_server_seq_seen, apply_mode FROM sync_client_info",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(next_change_id, 1);
        assert_eq!(last_seen, 0);
        assert_eq!(apply_mode, 0);
    }
}
