/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! oversqlite: the client half of an offline-first, multi-device sync
//! engine over SQLite.
//!
//! The application keeps writing its business tables with ordinary SQL;
//! capture triggers coalesce those writes into a pending queue, and
//! [`SyncStore`] exchanges row-level changes with a central server that
//! owns a per-user change log. See the module docs on [`store`] and
//! [`protocol`] for the moving parts.

#![warn(rust_2018_idioms)]

mod bootstrap;
pub mod config;
mod db;
pub mod error;
pub mod merge;
mod payload;
pub mod protocol;
mod schema;
pub mod store;
mod sync;
mod table_info;
pub mod transport;
mod triggers;

pub use config::{SyncConfig, SyncedTable};
pub use error::{Error, Result};
pub use merge::{ConflictResolver, LexicographicWins, MergeResult, ServerWins};
pub use payload::{dashed_uuid_to_hex, hex_to_dashed_uuid};
pub use store::{SyncOnceSummary, SyncStore, TablesChangedObserver};
pub use sync::UploadSummary;
pub use table_info::{ColumnInfo, TableInfo};
#[cfg(feature = "reqwest-transport")]
pub use transport::ReqwestTransport;
pub use transport::{Response, Transport, TransportError};
