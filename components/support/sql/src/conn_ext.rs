/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    types::FromSql, Connection, Params, Result as SqlResult, Row, Savepoint, Transaction,
    TransactionBehavior,
};
use std::ops::Deref;
use std::time::Instant;

/// Helpers shared by everything that can hand out a `rusqlite::Connection`.
/// Import the trait to use these on `Connection`, `Transaction` etc.
pub trait ConnExt {
    /// The only method implementors must provide.
    fn conn(&self) -> &Connection;

    /// Execute all the provided statements, one at a time.
    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    /// Like `Connection::execute`, but goes through the prepared statement
    /// cache so repeated calls don't re-prepare.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Run a query that returns a single value in a single row.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like `query_one`, with parameters, returning `None` when no row
    /// matches.
    fn try_query_one<T: FromSql, P: Params>(&self, sql: &str, params: P) -> SqlResult<Option<T>> {
        use rusqlite::OptionalExtension;
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.query_row(params, |row| row.get(0)).optional()
    }

    /// Run a fallible mapper over a single optional row.
    fn try_query_row<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Option<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnOnce(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        Ok(match rows.next()? {
            None => None,
            Some(row) => Some(mapper(row)?),
        })
    }

    /// Collect every row of a query through a fallible mapper, using the
    /// statement cache.
    fn query_rows_and_then_cached<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Vec<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnMut(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_and_then(params, mapper)?;
        rows.collect()
    }

    /// Begin an `UncheckedTransaction` (deferred).
    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }

    /// Begin an `UncheckedTransaction` with `BEGIN IMMEDIATE`, for phases
    /// that will certainly write.
    fn unchecked_transaction_imm(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Immediate)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl<'conn> ConnExt for Transaction<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl<'conn> ConnExt for Savepoint<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite wants a `&mut Connection` to start a `Transaction`, which is
/// awkward for types holding the connection behind a shared reference. This
/// is the same idea minus the compile-time exclusivity: the caller is on the
/// hook for not nesting them (use a savepoint if you need nesting).
///
/// Rolls back on drop unless committed.
pub struct UncheckedTransaction<'conn> {
    conn: &'conn Connection,
    started_at: Instant,
}

impl<'conn> UncheckedTransaction<'conn> {
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let begin = match behavior {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(begin).map(|_| UncheckedTransaction {
            conn,
            started_at: Instant::now(),
        })
    }

    /// Consumes and commits the transaction.
    pub fn commit(self) -> SqlResult<()> {
        self.conn.execute_batch("COMMIT")?;
        log::trace!("Transaction committed after {:?}", self.started_at.elapsed());
        Ok(())
    }

    /// Consumes and rolls back the transaction.
    pub fn rollback(self) -> SqlResult<()> {
        self.rollback_()
    }

    fn rollback_(&self) -> SqlResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn finish_(&self) -> SqlResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.rollback_()
    }
}

impl<'conn> Deref for UncheckedTransaction<'conn> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl<'conn> Drop for UncheckedTransaction<'conn> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_() {
            log::warn!("Error dropping an unchecked transaction: {}", e);
        }
    }
}

impl<'conn> ConnExt for UncheckedTransaction<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}
