/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! One-shot setup: metadata tables, device registration, capture triggers.
//! Safe to run any number of times; a partial run can simply be retried.

use crate::config::SyncConfig;
use crate::db::SyncDb;
use crate::error::*;
use crate::{schema, triggers};
use rusqlite::named_params;
use sql_support::ConnExt;

pub(crate) fn bootstrap(
    db: &SyncDb,
    config: &SyncConfig,
    user_id: &str,
    source_id: &str,
) -> Result<()> {
    log::debug!("Bootstrapping sync for user {}", user_id);
    let tx = db.unchecked_transaction()?;
    schema::ensure_tables(&tx)?;

    match db.try_client_info()? {
        None => {
            db.execute_cached(
                "INSERT INTO sync_client_info
                     (user_id, source_id, next_change_id, last_server_seq_seen,
                      apply_mode, current_window_until)
                 VALUES (:user_id, :source_id, 1, 0, 0, 0)",
                named_params! { ":user_id": user_id, ":source_id": source_id },
            )?;
        }
        Some(info) => {
            if info.user_id != user_id {
                return Err(Error::LocalInconsistency(format!(
                    "database already registered to another user (expected {:?})",
                    info.user_id
                )));
            }
            // Recover from a previous abort mid-apply, and pick up a new
            // install id if one was issued.
            db.execute_cached(
                "UPDATE sync_client_info
                 SET source_id = :source_id, apply_mode = 0, current_window_until = 0",
                named_params! { ":source_id": source_id },
            )?;
        }
    }

    // Schemas may have changed since the last run; triggers are cheap to
    // regenerate and must match the current column set.
    db.invalidate_table_infos();
    for table in &config.sync_tables {
        let info = db.table_info(&table.table_name, table.sync_key_column_name.as_deref())?;
        triggers::install_capture_triggers(&tx, &info)?;
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncedTable;
    use crate::protocol::ChangeOp;

    fn db_and_config() -> (SyncDb, SyncConfig) {
        let db = SyncDb::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT)")
            .unwrap();
        let config = SyncConfig::new("app", vec![SyncedTable::new("users")]).unwrap();
        (db, config)
    }

    #[test]
    fn test_bootstrap_registers_device() {
        let (db, config) = db_and_config();
        bootstrap(&db, &config, "user-1", "device-a").unwrap();
        let info = db.client_info().unwrap();
        assert_eq!(info.user_id, "user-1");
        assert_eq!(info.source_id, "device-a");
        assert_eq!(info.next_change_id, 1);
        assert_eq!(info.last_server_seq_seen, 0);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let (db, config) = db_and_config();
        bootstrap(&db, &config, "user-1", "device-a").unwrap();

        // accumulate some state, then bootstrap again
        db.execute("INSERT INTO users (id, name) VALUES ('u1', 'A')", [])
            .unwrap();
        db.set_last_server_seq_seen(9).unwrap();
        let change_id_before = db.client_info().unwrap().next_change_id;

        bootstrap(&db, &config, "user-1", "device-a").unwrap();
        let info = db.client_info().unwrap();
        assert_eq!(info.next_change_id, change_id_before);
        assert_eq!(info.last_server_seq_seen, 9);
        let row = db.pending_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.op, ChangeOp::Insert);

        // and the re-created triggers still fire
        db.execute("INSERT INTO users (id, name) VALUES ('u2', 'B')", [])
            .unwrap();
        assert!(db.pending_row("users", "u2").unwrap().is_some());
    }

    #[test]
    fn test_bootstrap_clears_stale_apply_mode() {
        let (db, config) = db_and_config();
        bootstrap(&db, &config, "user-1", "device-a").unwrap();
        db.set_apply_mode(true).unwrap();
        db.set_window_until(55).unwrap();

        bootstrap(&db, &config, "user-1", "device-a").unwrap();
        let info = db.client_info().unwrap();
        assert!(!info.apply_mode);
        assert_eq!(info.current_window_until, 0);
    }

    #[test]
    fn test_bootstrap_rejects_other_user() {
        let (db, config) = db_and_config();
        bootstrap(&db, &config, "user-1", "device-a").unwrap();
        assert!(matches!(
            bootstrap(&db, &config, "user-2", "device-a"),
            Err(Error::LocalInconsistency(_))
        ));
    }
}
