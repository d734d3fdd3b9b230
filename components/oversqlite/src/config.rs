/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::*;

pub const DEFAULT_UPLOAD_LIMIT: usize = 200;
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 1000;
pub const DEFAULT_WINDOW_LOOKBACK: u32 = 100;
pub const DEFAULT_LOOKBACK_MAX_PASSES: u32 = 50;
pub const DEFAULT_UPLOAD_PATH: &str = "/sync/upload";
pub const DEFAULT_DOWNLOAD_PATH: &str = "/sync/download";

/// A business table registered for syncing.
#[derive(Debug, Clone)]
pub struct SyncedTable {
    pub table_name: String,
    /// Explicit sync key column. When `None` the declared primary key is
    /// used, falling back to a column named `id`.
    pub sync_key_column_name: Option<String>,
}

impl SyncedTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into().to_lowercase(),
            sync_key_column_name: None,
        }
    }

    pub fn with_key(table_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into().to_lowercase(),
            sync_key_column_name: Some(key.into().to_lowercase()),
        }
    }
}

/// Everything the engine needs to know that isn't stored in the database.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server-registered schema name; must match `^[a-z0-9_]+$`.
    pub schema: String,
    pub sync_tables: Vec<SyncedTable>,
    /// Maximum changes per upload batch.
    pub upload_limit: usize,
    /// Page size for downloads.
    pub download_limit: usize,
    /// Reserved for windowing heuristics; stored but currently unused.
    pub sync_window_lookback: u32,
    /// Ceiling for the post-upload lookback loop.
    pub lookback_max_passes: u32,
    pub upload_path: String,
    pub download_path: String,
    /// Emit payload-level debug records.
    pub verbose_logs: bool,
}

impl SyncConfig {
    pub fn new(schema: impl Into<String>, sync_tables: Vec<SyncedTable>) -> Result<Self> {
        let schema = schema.into();
        if !is_valid_schema_name(&schema) {
            return Err(Error::InvalidSchemaName(schema));
        }
        Ok(Self {
            schema,
            sync_tables,
            upload_limit: DEFAULT_UPLOAD_LIMIT,
            download_limit: DEFAULT_DOWNLOAD_LIMIT,
            sync_window_lookback: DEFAULT_WINDOW_LOOKBACK,
            lookback_max_passes: DEFAULT_LOOKBACK_MAX_PASSES,
            upload_path: DEFAULT_UPLOAD_PATH.to_string(),
            download_path: DEFAULT_DOWNLOAD_PATH.to_string(),
            verbose_logs: false,
        })
    }

    pub(crate) fn table(&self, name: &str) -> Option<&SyncedTable> {
        self.sync_tables.iter().find(|t| t.table_name == name)
    }
}

// A full regex engine would be overkill for this one scan.
fn is_valid_schema_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}
