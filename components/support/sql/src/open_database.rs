/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Open a SQLite database, initializing or upgrading its schema as needed.
//!
//! The schema version lives in `PRAGMA user_version`. A fresh database gets
//! `init()`, an existing one gets `upgrade_from()` once per missing version,
//! and everything runs inside a single transaction so a failed open leaves
//! the file as it was.

use crate::ConnExt;
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database version too new: {0}")]
    VersionTooNew(u32),

    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a component needs to tell us to get its database opened.
pub trait ConnectionInitializer {
    /// Display name for logging.
    const NAME: &'static str;

    /// The version `init()` creates and `upgrade_from()` upgrades towards.
    const END_VERSION: u32;

    /// Runs outside the versioning transaction, before anything else.
    /// The place for pragmas and sql function registration.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    /// Initialize an empty database to `END_VERSION`.
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    /// Upgrade from `version` to `version + 1`.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    /// Runs inside the transaction after init/upgrades.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    fn exists(&self) -> bool {
        match self {
            DatabaseLocation::Memory => false,
            DatabaseLocation::File(path) => path.exists(),
        }
    }

    fn open(&self, flags: OpenFlags) -> Result<Connection> {
        match self {
            DatabaseLocation::Memory => Ok(Connection::open_in_memory_with_flags(flags)?),
            DatabaseLocation::File(path) => Ok(Connection::open_with_flags(path, flags)?),
        }
    }
}

pub fn open_database<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(
        DatabaseLocation::File(path.as_ref().to_path_buf()),
        OpenFlags::default(),
        initializer,
    )
}

pub fn open_memory_database<CI: ConnectionInitializer>(initializer: &CI) -> Result<Connection> {
    open_database_with_flags(DatabaseLocation::Memory, OpenFlags::default(), initializer)
}

pub fn open_database_with_flags<CI: ConnectionInitializer>(
    location: DatabaseLocation,
    flags: OpenFlags,
    initializer: &CI,
) -> Result<Connection> {
    log::debug!("{}: opening database", CI::NAME);
    let db_empty = !location.exists();
    let mut conn = location.open(flags)?;
    initializer.prepare(&conn, db_empty)?;

    let tx = conn.transaction()?;
    let mut current = tx.query_one::<u32>("PRAGMA user_version")?;
    if current == 0 {
        log::debug!("{}: initializing new database", CI::NAME);
        initializer.init(&tx)?;
    } else if current > CI::END_VERSION {
        return Err(Error::VersionTooNew(current));
    } else {
        while current < CI::END_VERSION {
            log::debug!("{}: upgrading database from {}", CI::NAME, current);
            initializer.upgrade_from(&tx, current)?;
            current += 1;
        }
    }
    tx.pragma_update(None, "user_version", CI::END_VERSION)?;
    initializer.finish(&tx)?;
    tx.commit()?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(conn)
}
