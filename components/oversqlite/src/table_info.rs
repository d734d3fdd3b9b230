/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::*;
use rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Lowercased column name.
    pub name: String,
    /// Lowercased declared type (may be empty for untyped columns).
    pub decl_type: String,
    pub is_pk: bool,
}

impl ColumnInfo {
    /// BLOB handling keys off the declared type, not the stored value.
    #[inline]
    pub fn is_blob(&self) -> bool {
        self.decl_type.contains("blob")
    }
}

/// Introspected shape of one business table: ordered columns, declared
/// types, and the sync key column. Cached per database handle by `SyncDb`
/// and invalidated on bootstrap, since schemas may change between runs.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub key_column: String,
    pub key_is_blob: bool,
}

impl TableInfo {
    pub fn introspect(conn: &Connection, table: &str, key_override: Option<&str>) -> Result<Self> {
        let table = table.to_lowercase();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
        let columns = stmt
            .query_and_then([], |row| -> Result<ColumnInfo> {
                Ok(ColumnInfo {
                    name: row.get::<_, String>("name")?.to_lowercase(),
                    decl_type: row.get::<_, String>("type")?.to_lowercase(),
                    is_pk: row.get::<_, i64>("pk")? != 0,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        if columns.is_empty() {
            return Err(Error::UnknownTable(table));
        }

        let key_column = match key_override {
            Some(key) => key.to_lowercase(),
            None => columns
                .iter()
                .find(|c| c.is_pk)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| "id".to_string()),
        };
        let key_is_blob = match columns.iter().find(|c| c.name == key_column) {
            Some(c) => c.is_blob(),
            None => return Err(Error::NoKeyColumn(table)),
        };

        Ok(Self {
            name: table,
            columns,
            key_column,
            key_is_blob,
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}
