/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Change capture lives in the database, not in application code: three
//! AFTER triggers per synced table feed `sync_pending` and `sync_row_meta`
//! no matter which code path wrote the row. Every trigger checks
//! `apply_mode` in its WHEN clause, so the engine can write business tables
//! without capturing its own applies.
//!
//! Coalescing is a small state machine on `sync_pending.op`:
//! INSERT+UPDATE stays INSERT, INSERT+DELETE cancels out entirely,
//! UPDATE+DELETE becomes DELETE, DELETE+INSERT becomes INSERT again. Any
//! overwrite clears `change_id`, making the row a fresh change in the eyes
//! of the uploader.

use crate::table_info::TableInfo;
use rusqlite::Connection;
use sql_support::ConnExt;

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";
const CAPTURING: &str = "(SELECT apply_mode FROM sync_client_info LIMIT 1) = 0";

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The canonical pk of the affected row: text keys verbatim, blob keys as
/// lowercase hex.
fn key_expr(info: &TableInfo, row: &str) -> String {
    let col = quote_ident(&info.key_column);
    if info.key_is_blob {
        format!("lower(hex({row}.{col}))", row = row, col = col)
    } else {
        format!("{row}.{col}", row = row, col = col)
    }
}

/// A `json_object(...)` over the full column set: lowercase keys, blob
/// columns rendered as lowercase hex.
fn row_image_expr(info: &TableInfo, row: &str) -> String {
    let mut args = Vec::with_capacity(info.columns.len() * 2);
    for col in &info.columns {
        args.push(format!("'{}'", col.name));
        let value = format!("{}.{}", row, quote_ident(&col.name));
        if col.is_blob() {
            args.push(format!("lower(hex({}))", value));
        } else {
            args.push(value);
        }
    }
    format!("json_object({})", args.join(", "))
}

fn current_version_expr(table: &str, key: &str) -> String {
    format!(
        "(SELECT server_version FROM sync_row_meta WHERE table_name = '{}' AND pk_uuid = {})",
        table, key
    )
}

fn insert_trigger_sql(info: &TableInfo) -> String {
    let table = &info.name;
    let key = key_expr(info, "NEW");
    let image = row_image_expr(info, "NEW");
    let version = current_version_expr(table, &key);
    format!(
        "CREATE TRIGGER {trigger} AFTER INSERT ON {table_ident}
         WHEN {capturing}
         BEGIN
             INSERT OR IGNORE INTO sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_at)
             VALUES ('{table}', {key}, 0, 0, {now});
             UPDATE sync_row_meta SET deleted = 0, updated_at = {now}
             WHERE table_name = '{table}' AND pk_uuid = {key};

             INSERT OR IGNORE INTO sync_pending (table_name, pk_uuid, op, base_version, payload, change_id, queued_at)
             VALUES ('{table}', {key}, 'INSERT', {version}, {image}, NULL, {now});
             UPDATE sync_pending SET
                 op = 'INSERT',
                 payload = {image},
                 base_version = {version},
                 change_id = NULL,
                 queued_at = {now}
             WHERE table_name = '{table}' AND pk_uuid = {key};

             UPDATE sync_client_info SET next_change_id = next_change_id + 1;
         END",
        trigger = quote_ident(&format!("trg_{}_ai", table)),
        table_ident = quote_ident(table),
        capturing = CAPTURING,
        table = table,
        key = key,
        image = image,
        version = version,
        now = NOW,
    )
}

fn update_trigger_sql(info: &TableInfo) -> String {
    let table = &info.name;
    let key = key_expr(info, "NEW");
    let image = row_image_expr(info, "NEW");
    let version = current_version_expr(table, &key);
    format!(
        "CREATE TRIGGER {trigger} AFTER UPDATE ON {table_ident}
         WHEN {capturing}
         BEGIN
             INSERT OR IGNORE INTO sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_at)
             VALUES ('{table}', {key}, 0, 0, {now});
             UPDATE sync_row_meta SET deleted = 0, updated_at = {now}
             WHERE table_name = '{table}' AND pk_uuid = {key};

             INSERT OR IGNORE INTO sync_pending (table_name, pk_uuid, op, base_version, payload, change_id, queued_at)
             VALUES ('{table}', {key}, 'UPDATE', {version}, {image}, NULL, {now});
             -- a pending INSERT stays an INSERT: the row is still new to the server
             UPDATE sync_pending SET
                 op = CASE op WHEN 'INSERT' THEN 'INSERT' ELSE 'UPDATE' END,
                 payload = {image},
                 base_version = CASE op WHEN 'INSERT' THEN base_version ELSE {version} END,
                 change_id = NULL,
                 queued_at = {now}
             WHERE table_name = '{table}' AND pk_uuid = {key};

             UPDATE sync_client_info SET next_change_id = next_change_id + 1;
         END",
        trigger = quote_ident(&format!("trg_{}_au", table)),
        table_ident = quote_ident(table),
        capturing = CAPTURING,
        table = table,
        key = key,
        image = image,
        version = version,
        now = NOW,
    )
}

fn delete_trigger_sql(info: &TableInfo) -> String {
    let table = &info.name;
    let key = key_expr(info, "OLD");
    let version = current_version_expr(table, &key);
    format!(
        "CREATE TRIGGER {trigger} AFTER DELETE ON {table_ident}
         WHEN {capturing}
         BEGIN
             INSERT OR IGNORE INTO sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_at)
             VALUES ('{table}', {key}, 0, 1, {now});
             UPDATE sync_row_meta SET deleted = 1, updated_at = {now}
             WHERE table_name = '{table}' AND pk_uuid = {key};

             -- deleting a row the server never saw cancels the queued INSERT
             DELETE FROM sync_pending
             WHERE table_name = '{table}' AND pk_uuid = {key} AND op = 'INSERT';

             -- rows the server knows about get a tombstone queued
             INSERT OR IGNORE INTO sync_pending (table_name, pk_uuid, op, base_version, payload, change_id, queued_at)
             SELECT '{table}', {key}, 'DELETE', m.server_version, NULL, NULL, {now}
             FROM sync_row_meta m
             WHERE m.table_name = '{table}' AND m.pk_uuid = {key} AND m.server_version > 0;
             UPDATE sync_pending SET
                 op = 'DELETE',
                 payload = NULL,
                 base_version = {version},
                 change_id = NULL,
                 queued_at = {now}
             WHERE table_name = '{table}' AND pk_uuid = {key};

             -- a never-synced row leaves no metadata behind
             DELETE FROM sync_row_meta
             WHERE table_name = '{table}' AND pk_uuid = {key} AND server_version = 0
               AND NOT EXISTS (SELECT 1 FROM sync_pending p
                               WHERE p.table_name = '{table}' AND p.pk_uuid = {key});

             UPDATE sync_client_info SET next_change_id = next_change_id + 1;
         END",
        trigger = quote_ident(&format!("trg_{}_ad", table)),
        table_ident = quote_ident(table),
        capturing = CAPTURING,
        table = table,
        key = key,
        version = version,
        now = NOW,
    )
}

/// Drop and re-create the three capture triggers for one table. Always run
/// from bootstrap so column or key changes are picked up.
pub(crate) fn install_capture_triggers(
    conn: &Connection,
    info: &TableInfo,
) -> rusqlite::Result<()> {
    log::debug!("Installing capture triggers for {}", info.name);
    for kind in ["ai", "au", "ad"] {
        conn.execute(
            &format!(
                "DROP TRIGGER IF EXISTS {}",
                quote_ident(&format!("trg_{}_{}", info.name, kind))
            ),
            [],
        )?;
    }
    let ai = insert_trigger_sql(info);
    let au = update_trigger_sql(info);
    let ad = delete_trigger_sql(info);
    conn.execute_all(&[ai.as_str(), au.as_str(), ad.as_str()])
}

#[cfg(test)]
mod tests {
    use crate::bootstrap::bootstrap;
    use crate::config::{SyncConfig, SyncedTable};
    use crate::db::SyncDb;
    use crate::protocol::ChangeOp;
    use sql_support::ConnExt;

    fn users_db() -> SyncDb {
        let db = SyncDb::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, email TEXT)")
            .unwrap();
        let config = SyncConfig::new("app", vec![SyncedTable::new("users")]).unwrap();
        bootstrap(&db, &config, "user-1", "device-a").unwrap();
        db
    }

    fn pending_count(db: &SyncDb) -> i64 {
        db.query_one("SELECT COUNT(*) FROM sync_pending").unwrap()
    }

    fn next_change_id(db: &SyncDb) -> i64 {
        db.client_info().unwrap().next_change_id
    }

    #[test]
    fn test_insert_captures_payload() {
        let db = users_db();
        db.execute(
            "INSERT INTO users (id, name, email) VALUES ('u1', 'Alice', 'a@x')",
            [],
        )
        .unwrap();
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Insert);
        assert_eq!(row.base_version, 0);
        let payload: serde_json::Value = serde_json::from_str(row.payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["id"], "u1");
        assert_eq!(payload["name"], "Alice");
        assert_eq!(payload["email"], "a@x");
        let meta = db.row_meta("users", "u1").unwrap().unwrap();
        assert_eq!(meta.server_version, 0);
        assert!(!meta.deleted);
    }

    #[test]
    fn test_insert_then_update_stays_insert() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        db.execute("UPDATE users SET name = 'Alicia' WHERE id = 'u1'", [])
            .unwrap();
        assert_eq!(pending_count(&db), 1);
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Insert);
        assert!(row.payload.unwrap().contains("Alicia"));
    }

    #[test]
    fn test_update_of_synced_row() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        // pretend the insert has been uploaded
        db.delete_pending("users", "u1").unwrap();
        db.put_row_meta("users", "u1", 4, false).unwrap();

        db.execute("UPDATE users SET name = 'Alicia' WHERE id = 'u1'", [])
            .unwrap();
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Update);
        assert_eq!(row.base_version, 4);
    }

    #[test]
    fn test_insert_then_delete_cancels_out() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u2', 'B')", [])
            .unwrap();
        db.execute("DELETE FROM users WHERE id = 'u2'", []).unwrap();
        assert_eq!(pending_count(&db), 0);
        // and no metadata either: the server never saw the row
        assert!(db.row_meta("users", "u2").unwrap().is_none());
    }

    #[test]
    fn test_insert_update_delete_sequence_coalesces() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u2', 'B')", [])
            .unwrap();
        db.execute("UPDATE users SET name = 'B2' WHERE id = 'u2'", [])
            .unwrap();
        db.execute("DELETE FROM users WHERE id = 'u2'", []).unwrap();
        assert_eq!(pending_count(&db), 0);
    }

    #[test]
    fn test_delete_of_synced_row_queues_tombstone() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        db.delete_pending("users", "u1").unwrap();
        db.put_row_meta("users", "u1", 2, false).unwrap();

        db.execute("DELETE FROM users WHERE id = 'u1'", []).unwrap();
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Delete);
        assert_eq!(row.base_version, 2);
        assert!(row.payload.is_none());
        assert!(db.row_meta("users", "u1").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_update_then_delete_becomes_delete() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        db.delete_pending("users", "u1").unwrap();
        db.put_row_meta("users", "u1", 2, false).unwrap();

        db.execute("UPDATE users SET name = 'Alicia' WHERE id = 'u1'", [])
            .unwrap();
        db.execute("DELETE FROM users WHERE id = 'u1'", []).unwrap();
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Delete);
        assert!(row.payload.is_none());
    }

    #[test]
    fn test_reinsert_clears_tombstone() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        db.delete_pending("users", "u1").unwrap();
        db.put_row_meta("users", "u1", 2, false).unwrap();
        db.execute("DELETE FROM users WHERE id = 'u1'", []).unwrap();
        assert!(db.row_meta("users", "u1").unwrap().unwrap().deleted);

        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Back')", [])
            .unwrap();
        let meta = db.row_meta("users", "u1").unwrap().unwrap();
        assert!(!meta.deleted);
        assert_eq!(meta.server_version, 2);
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Insert);
        assert_eq!(row.base_version, 2);
    }

    #[test]
    fn test_coalescing_clears_change_id() {
        let db = users_db();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        db.assign_pending_change_id("users", "u1", 9).unwrap();
        db.execute("UPDATE users SET name = 'Alicia' WHERE id = 'u1'", [])
            .unwrap();
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.change_id, None);
    }

    #[test]
    fn test_apply_mode_suppresses_capture() {
        let db = users_db();
        db.set_apply_mode(true).unwrap();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        db.execute("UPDATE users SET name = 'x' WHERE id = 'u1'", [])
            .unwrap();
        db.execute("DELETE FROM users WHERE id = 'u1'", []).unwrap();
        assert_eq!(pending_count(&db), 0);
        assert!(db.row_meta("users", "u1").unwrap().is_none());

        db.set_apply_mode(false).unwrap();
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'Alice')", [])
            .unwrap();
        assert_eq!(pending_count(&db), 1);
    }

    #[test]
    fn test_next_change_id_bumps_on_every_write() {
        let db = users_db();
        let before = next_change_id(&db);
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'A')", [])
            .unwrap();
        db.execute("UPDATE users SET name = 'B' WHERE id = 'u1'", [])
            .unwrap();
        db.execute("DELETE FROM users WHERE id = 'u1'", []).unwrap();
        assert_eq!(next_change_id(&db), before + 3);
    }

    #[test]
    fn test_blob_key_is_hex_in_queue() {
        let db = SyncDb::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE files (id BLOB PRIMARY KEY, name TEXT, data BLOB)")
            .unwrap();
        let config = SyncConfig::new("app", vec![SyncedTable::new("files")]).unwrap();
        bootstrap(&db, &config, "user-1", "device-a").unwrap();

        let id: Vec<u8> = vec![0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        db.execute(
            "INSERT INTO files (id, name, data) VALUES (?, 'f', x'0102')",
            [&id],
        )
        .unwrap();
        let expected = base16::encode_lower(&id);
        let row = db.pending_row("files", &expected).unwrap().unwrap();
        let payload: serde_json::Value = serde_json::from_str(row.payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["id"], serde_json::Value::String(expected));
        assert_eq!(payload["data"], "0102");
    }
}
