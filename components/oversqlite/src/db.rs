/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::*;
use crate::protocol::ChangeOp;
use crate::schema::SyncConnectionInitializer;
use crate::table_info::TableInfo;
use rusqlite::{named_params, Connection, OpenFlags};
use sql_support::open_database::{open_database_with_flags, DatabaseLocation};
use sql_support::ConnExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

/// The single-row contents of `sync_client_info`.
#[derive(Debug, Clone)]
pub(crate) struct ClientInfo {
    pub user_id: String,
    pub source_id: String,
    pub next_change_id: i64,
    pub last_server_seq_seen: i64,
    pub apply_mode: bool,
    pub current_window_until: i64,
}

/// One row of `sync_pending`.
#[derive(Debug, Clone)]
pub(crate) struct PendingRow {
    pub table_name: String,
    pub pk_uuid: String,
    pub op: ChangeOp,
    pub base_version: i64,
    pub payload: Option<String>,
    pub change_id: Option<i64>,
}

/// One row of `sync_row_meta`.
#[derive(Debug, Clone)]
pub(crate) struct RowMeta {
    pub server_version: i64,
    pub deleted: bool,
}

/// The engine's view of the database: the app's business tables plus the
/// sync metadata. One connection, used by one sync pipeline at a time (the
/// store's gate enforces that).
pub struct SyncDb {
    pub db: Connection,
    table_infos: RefCell<HashMap<String, Arc<TableInfo>>>,
}

impl SyncDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE;
        Self::open_with_flags(DatabaseLocation::File(path.as_ref().to_path_buf()), flags)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_with_flags(DatabaseLocation::Memory, OpenFlags::default())
    }

    fn open_with_flags(location: DatabaseLocation, flags: OpenFlags) -> Result<Self> {
        let db = open_database_with_flags(location, flags, &SyncConnectionInitializer)?;
        Ok(Self {
            db,
            table_infos: RefCell::new(HashMap::new()),
        })
    }

    /// Interrupting a statement aborts the phase; the surrounding
    /// transaction rolls back, so durable state stays consistent.
    pub fn new_interrupt_handle(&self) -> rusqlite::InterruptHandle {
        self.db.get_interrupt_handle()
    }

    /// Introspect (or fetch the cached shape of) a business table.
    pub(crate) fn table_info(
        &self,
        table: &str,
        key_override: Option<&str>,
    ) -> Result<Arc<TableInfo>> {
        if let Some(info) = self.table_infos.borrow().get(table) {
            return Ok(Arc::clone(info));
        }
        let info = Arc::new(TableInfo::introspect(&self.db, table, key_override)?);
        self.table_infos
            .borrow_mut()
            .insert(info.name.clone(), Arc::clone(&info));
        Ok(info)
    }

    /// Bootstrap calls this: schemas may have changed since the cache was
    /// filled.
    pub(crate) fn invalidate_table_infos(&self) {
        self.table_infos.borrow_mut().clear();
    }

    // -- sync_client_info ---------------------------------------------------

    pub(crate) fn try_client_info(&self) -> Result<Option<ClientInfo>> {
        self.db.try_query_row(
            "SELECT user_id, source_id, next_change_id, last_server_seq_seen,
                    apply_mode, current_window_until
             FROM sync_client_info LIMIT 1",
            [],
            |row| -> Result<ClientInfo> {
                Ok(ClientInfo {
                    user_id: row.get(0)?,
                    source_id: row.get(1)?,
                    next_change_id: row.get(2)?,
                    last_server_seq_seen: row.get(3)?,
                    apply_mode: row.get::<_, i64>(4)? != 0,
                    current_window_until: row.get(5)?,
                })
            },
        )
    }

    pub(crate) fn client_info(&self) -> Result<ClientInfo> {
        self.try_client_info()?.ok_or_else(|| {
            Error::LocalInconsistency("no sync_client_info row; bootstrap required".into())
        })
    }

    pub(crate) fn set_next_change_id_at_least(&self, value: i64) -> Result<()> {
        self.db.execute_cached(
            "UPDATE sync_client_info SET next_change_id = MAX(next_change_id, :value)",
            named_params! { ":value": value },
        )?;
        Ok(())
    }

    pub(crate) fn set_last_server_seq_seen(&self, value: i64) -> Result<()> {
        self.db.execute_cached(
            "UPDATE sync_client_info SET last_server_seq_seen = :value",
            named_params! { ":value": value },
        )?;
        Ok(())
    }

    pub(crate) fn set_apply_mode(&self, applying: bool) -> Result<()> {
        self.db.execute_cached(
            "UPDATE sync_client_info SET apply_mode = :mode",
            named_params! { ":mode": applying as i64 },
        )?;
        Ok(())
    }

    pub(crate) fn set_window_until(&self, value: i64) -> Result<()> {
        self.db.execute_cached(
            "UPDATE sync_client_info SET current_window_until = :value",
            named_params! { ":value": value },
        )?;
        Ok(())
    }

    // -- sync_pending -------------------------------------------------------

    /// The queue, in upload order.
    pub(crate) fn pending_rows(&self, limit: usize) -> Result<Vec<PendingRow>> {
        self.db.query_rows_and_then_cached(
            "SELECT table_name, pk_uuid, op, base_version, payload, change_id
             FROM sync_pending ORDER BY queued_at ASC, rowid ASC LIMIT :limit",
            named_params! { ":limit": limit as i64 },
            |row| -> Result<PendingRow> {
                let op: String = row.get(2)?;
                Ok(PendingRow {
                    table_name: row.get(0)?,
                    pk_uuid: row.get(1)?,
                    op: ChangeOp::from_str(&op).ok_or_else(|| {
                        Error::LocalInconsistency(format!("illegal pending op {:?}", op))
                    })?,
                    base_version: row.get(3)?,
                    payload: row.get(4)?,
                    change_id: row.get(5)?,
                })
            },
        )
    }

    pub(crate) fn pending_row(&self, table: &str, pk_uuid: &str) -> Result<Option<PendingRow>> {
        self.db.try_query_row(
            "SELECT table_name, pk_uuid, op, base_version, payload, change_id
             FROM sync_pending WHERE table_name = :table AND pk_uuid = :pk",
            named_params! { ":table": table, ":pk": pk_uuid },
            |row| -> Result<PendingRow> {
                let op: String = row.get(2)?;
                Ok(PendingRow {
                    table_name: row.get(0)?,
                    pk_uuid: row.get(1)?,
                    op: ChangeOp::from_str(&op).ok_or_else(|| {
                        Error::LocalInconsistency(format!("illegal pending op {:?}", op))
                    })?,
                    base_version: row.get(3)?,
                    payload: row.get(4)?,
                    change_id: row.get(5)?,
                })
            },
        )
    }

    pub(crate) fn assign_pending_change_id(
        &self,
        table: &str,
        pk_uuid: &str,
        change_id: i64,
    ) -> Result<()> {
        self.db.execute_cached(
            "UPDATE sync_pending SET change_id = :change_id
             WHERE table_name = :table AND pk_uuid = :pk",
            named_params! { ":change_id": change_id, ":table": table, ":pk": pk_uuid },
        )?;
        Ok(())
    }

    /// Remove a pending row, but only if it still carries the change id we
    /// uploaded. A concurrent local write during the network phase clears
    /// `change_id`, and that newer change must survive finalize.
    pub(crate) fn delete_pending_if_unchanged(
        &self,
        table: &str,
        pk_uuid: &str,
        change_id: i64,
    ) -> Result<()> {
        self.db.execute_cached(
            "DELETE FROM sync_pending
             WHERE table_name = :table AND pk_uuid = :pk AND change_id = :change_id",
            named_params! { ":table": table, ":pk": pk_uuid, ":change_id": change_id },
        )?;
        Ok(())
    }

    pub(crate) fn delete_pending(&self, table: &str, pk_uuid: &str) -> Result<()> {
        self.db.execute_cached(
            "DELETE FROM sync_pending WHERE table_name = :table AND pk_uuid = :pk",
            named_params! { ":table": table, ":pk": pk_uuid },
        )?;
        Ok(())
    }

    /// Rewrite a pending row after conflict resolution: it becomes a fresh,
    /// not-yet-uploaded change based on the server version we just learned.
    pub(crate) fn rewrite_pending(
        &self,
        table: &str,
        pk_uuid: &str,
        op: ChangeOp,
        base_version: i64,
        payload: Option<&str>,
    ) -> Result<()> {
        self.db.execute_cached(
            "INSERT INTO sync_pending (table_name, pk_uuid, op, base_version, payload, change_id, queued_at)
             VALUES (:table, :pk, :op, :base, :payload, NULL, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT (table_name, pk_uuid) DO UPDATE SET
                 op = excluded.op,
                 base_version = excluded.base_version,
                 payload = excluded.payload,
                 change_id = NULL,
                 queued_at = excluded.queued_at",
            named_params! {
                ":table": table,
                ":pk": pk_uuid,
                ":op": op.as_str(),
                ":base": base_version,
                ":payload": payload,
            },
        )?;
        Ok(())
    }

    // -- sync_row_meta ------------------------------------------------------

    pub(crate) fn row_meta(&self, table: &str, pk_uuid: &str) -> Result<Option<RowMeta>> {
        self.db.try_query_row(
            "SELECT server_version, deleted FROM sync_row_meta
             WHERE table_name = :table AND pk_uuid = :pk",
            named_params! { ":table": table, ":pk": pk_uuid },
            |row| -> Result<RowMeta> {
                Ok(RowMeta {
                    server_version: row.get(0)?,
                    deleted: row.get::<_, i64>(1)? != 0,
                })
            },
        )
    }

    pub(crate) fn put_row_meta(
        &self,
        table: &str,
        pk_uuid: &str,
        server_version: i64,
        deleted: bool,
    ) -> Result<()> {
        self.db.execute_cached(
            "INSERT INTO sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_at)
             VALUES (:table, :pk, :version, :deleted, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT (table_name, pk_uuid) DO UPDATE SET
                 server_version = excluded.server_version,
                 deleted = excluded.deleted,
                 updated_at = excluded.updated_at",
            named_params! {
                ":table": table,
                ":pk": pk_uuid,
                ":version": server_version,
                ":deleted": deleted as i64,
            },
        )?;
        Ok(())
    }
}

impl ConnExt for SyncDb {
    #[inline]
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl Deref for SyncDb {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        &self.db
    }
}
