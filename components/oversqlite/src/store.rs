/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The public surface of the engine.
//!
//! `SyncStore` owns the database behind a single-permit gate (a plain
//! mutex): every DB phase locks it, network round-trips run with it
//! released so local writes never stall on the network. The application
//! keeps using the same database through `with_connection`; the capture
//! triggers take care of the rest.

use crate::bootstrap;
use crate::config::SyncConfig;
use crate::db::SyncDb;
use crate::error::*;
use crate::merge::{ConflictResolver, ServerWins};
use crate::sync::download::{self, FetchParams};
use crate::sync::upload::{self, UploadSummary};
use crate::transport::Transport;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// Called with the sorted set of business tables a sync call changed.
pub type TablesChangedObserver = Box<dyn Fn(&[String]) + Send + Sync>;

/// Aggregate result of `sync_once`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOnceSummary {
    pub upload: UploadSummary,
    pub downloaded: usize,
    pub next_after: i64,
}

pub struct SyncStore {
    db: Mutex<SyncDb>,
    config: SyncConfig,
    base_url: Url,
    transport: Arc<dyn Transport>,
    resolver: Box<dyn ConflictResolver>,
    uploads_paused: AtomicBool,
    downloads_paused: AtomicBool,
    observer: Mutex<Option<TablesChangedObserver>>,
}

impl SyncStore {
    pub fn new(
        path: impl AsRef<Path>,
        config: SyncConfig,
        base_url: Url,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Ok(Self::with_db(SyncDb::open(path)?, config, base_url, transport))
    }

    pub fn new_in_memory(
        config: SyncConfig,
        base_url: Url,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Ok(Self::with_db(
            SyncDb::open_in_memory()?,
            config,
            base_url,
            transport,
        ))
    }

    fn with_db(db: SyncDb, config: SyncConfig, base_url: Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            db: Mutex::new(db),
            config,
            base_url,
            transport,
            resolver: Box::new(ServerWins),
            uploads_paused: AtomicBool::new(false),
            downloads_paused: AtomicBool::new(false),
            observer: Mutex::new(None),
        }
    }

    /// Swap the conflict policy; the default is server-wins.
    pub fn set_conflict_resolver(&mut self, resolver: Box<dyn ConflictResolver>) {
        self.resolver = resolver;
    }

    pub fn set_tables_changed_observer(&self, observer: Option<TablesChangedObserver>) {
        *self.observer.lock() = observer;
    }

    /// Run application SQL against the underlying connection, holding the
    /// database gate for the duration of the callback.
    pub fn with_connection<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
    {
        let db = self.db.lock();
        f(&db.db)
    }

    /// Interrupts whatever statement the engine is running; the in-flight
    /// transaction rolls back and the call returns an error.
    pub fn new_interrupt_handle(&self) -> rusqlite::InterruptHandle {
        self.db.lock().new_interrupt_handle()
    }

    /// One-shot setup: metadata tables, device registration, capture
    /// triggers. Idempotent; run it once per process before syncing.
    pub fn bootstrap(&self, user_id: &str, source_id: &str) -> Result<()> {
        bootstrap::bootstrap(&self.db.lock(), &self.config, user_id, source_id)
    }

    pub fn pause_uploads(&self) {
        self.uploads_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_uploads(&self) {
        self.uploads_paused.store(false, Ordering::SeqCst);
    }

    pub fn pause_downloads(&self) {
        self.downloads_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_downloads(&self) {
        self.downloads_paused.store(false, Ordering::SeqCst);
    }

    /// Drain the pending queue once: prepare under the gate, one POST with
    /// the gate released, finalize under the gate, then a lookback drain
    /// over the range the upload may have skipped.
    pub fn upload_once(&self) -> Result<UploadSummary> {
        if self.uploads_paused.load(Ordering::SeqCst) {
            log::debug!("Uploads are paused");
            return Ok(UploadSummary::default());
        }
        let batch = match upload::prepare(&self.db.lock(), &self.config)? {
            Some(batch) => batch,
            // An empty queue makes no network call at all.
            None => return Ok(UploadSummary::default()),
        };
        let response = upload::perform(
            self.transport.as_ref(),
            &self.base_url,
            &self.config,
            &batch.request,
        )?;
        let (summary, mut touched) = upload::finalize(
            &self.db.lock(),
            &self.config,
            self.resolver.as_ref(),
            &batch,
            &response,
        )?;
        if summary.total > 0 {
            touched.extend(self.run_lookback_drain()?);
        }
        self.notify_tables_changed(touched);
        Ok(summary)
    }

    /// Fetch and apply one page of peer changes. Returns the number of
    /// changes applied and the new cursor.
    pub fn download_once(
        &self,
        limit: usize,
        include_self: bool,
        until: i64,
    ) -> Result<(usize, i64)> {
        if self.downloads_paused.load(Ordering::SeqCst) {
            log::debug!("Downloads are paused");
            return Ok((0, 0));
        }
        let after = self.db.lock().client_info()?.last_server_seq_seen;
        let page = download::fetch(
            self.transport.as_ref(),
            &self.base_url,
            &self.config,
            FetchParams {
                after,
                limit,
                include_self,
                until,
            },
        )?;
        let outcome = download::apply(
            &self.db.lock(),
            &self.config,
            self.resolver.as_ref(),
            &page,
            include_self,
            false,
        )?;
        self.notify_tables_changed(outcome.touched);
        Ok((outcome.applied, outcome.next_after))
    }

    /// Materialize the server's current state, for first-run or recovery.
    /// With `windowed` the first page freezes an upper bound so a multi-page
    /// hydration observes a single snapshot.
    pub fn hydrate(&self, include_self: bool, limit: usize, windowed: bool) -> Result<()> {
        if self.downloads_paused.load(Ordering::SeqCst) {
            log::debug!("Downloads are paused");
            return Ok(());
        }
        let mut window_until = 0;
        let mut first_page = true;
        let mut touched = BTreeSet::new();
        loop {
            let after = self.db.lock().client_info()?.last_server_seq_seen;
            let page = download::fetch(
                self.transport.as_ref(),
                &self.base_url,
                &self.config,
                FetchParams {
                    after,
                    limit,
                    include_self,
                    until: window_until,
                },
            )?;
            if first_page {
                first_page = false;
                if windowed && page.window_until > 0 {
                    window_until = page.window_until;
                    self.db.lock().set_window_until(window_until)?;
                }
            }
            let outcome = download::apply(
                &self.db.lock(),
                &self.config,
                self.resolver.as_ref(),
                &page,
                include_self,
                false,
            )?;
            touched.extend(outcome.touched);
            if !page.has_more {
                break;
            }
            if outcome.next_after <= after {
                log::warn!("Hydration made no progress at cursor {}; stopping", after);
                break;
            }
        }
        self.db.lock().set_window_until(0)?;
        self.notify_tables_changed(touched);
        Ok(())
    }

    /// Upload, then keep downloading pages while they come back full.
    pub fn sync_once(&self, limit: usize, include_self: bool) -> Result<SyncOnceSummary> {
        let upload = self.upload_once()?;
        let mut summary = SyncOnceSummary {
            upload,
            ..SyncOnceSummary::default()
        };
        for _ in 0..self.config.lookback_max_passes {
            let (applied, next_after) = self.download_once(limit, include_self, 0)?;
            summary.downloaded += applied;
            summary.next_after = next_after;
            if applied < limit {
                break;
            }
        }
        Ok(summary)
    }

    /// After an upload, the server's watermark may cover peer changes we
    /// haven't downloaded. Re-scan a bounded range below the watermark with
    /// version guards so nothing (a peer's DELETE in particular) is skipped
    /// by the cursor jump.
    fn run_lookback_drain(&self) -> Result<BTreeSet<String>> {
        let mut touched = BTreeSet::new();
        let (target, limit) = {
            let db = self.db.lock();
            let info = db.client_info()?;
            (info.last_server_seq_seen, self.config.download_limit)
        };
        let lookback = 1000.max(2 * limit as i64);
        let start = 0.max(target - lookback);
        if start < target {
            self.db.lock().set_last_server_seq_seen(start)?;
        }

        let drained = (|| -> Result<()> {
            for _ in 0..self.config.lookback_max_passes {
                let cursor = self.db.lock().client_info()?.last_server_seq_seen;
                if cursor >= target {
                    break;
                }
                let page = download::fetch(
                    self.transport.as_ref(),
                    &self.base_url,
                    &self.config,
                    FetchParams {
                        after: cursor,
                        limit,
                        include_self: true,
                        until: 0,
                    },
                )?;
                let outcome = download::apply(
                    &self.db.lock(),
                    &self.config,
                    self.resolver.as_ref(),
                    &page,
                    true,
                    true,
                )?;
                touched.extend(outcome.touched);
                if outcome.applied == 0 || outcome.next_after <= cursor {
                    break;
                }
            }
            Ok(())
        })();

        // Never leave the cursor below where the upload put it, drained or
        // not: normal syncing must not re-process this range.
        {
            let db = self.db.lock();
            if db.client_info()?.last_server_seq_seen < target {
                db.set_last_server_seq_seen(target)?;
            }
        }
        drained?;
        Ok(touched)
    }

    fn notify_tables_changed(&self, touched: BTreeSet<String>) {
        if touched.is_empty() {
            return;
        }
        let observer = self.observer.lock();
        if let Some(observer) = observer.as_ref() {
            let tables: Vec<String> = touched.into_iter().collect();
            observer(&tables);
        }
    }
}
