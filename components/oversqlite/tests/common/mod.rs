/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An in-process sync server plus a two-device test harness.
//!
//! The server keeps the per-user change log, assigns `server_id` /
//! `server_version`, enforces optimistic concurrency on upload, and dedupes
//! replays on `(source_id, source_change_id)` - the same contract the real
//! one exposes over HTTP. Each `Device` talks to it through a `Transport`
//! that never leaves the process.

#![allow(dead_code)]

use oversqlite::protocol::{
    ChangeOp, ChangeStatus, DownloadResponse, JsonObject, ServerChange, ServerRow,
    UploadRequest, UploadResponse, UploadStatusKind,
};
use oversqlite::transport::{Response, Transport, TransportError};
use oversqlite::{SyncConfig, SyncStore, SyncedTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

#[derive(Clone)]
struct ServerRowState {
    server_version: i64,
    deleted: bool,
    payload: Option<JsonObject>,
}

#[derive(Default)]
pub struct ServerState {
    last_server_id: i64,
    log: Vec<ServerChange>,
    rows: HashMap<(String, String), ServerRowState>,
    seen: HashMap<(String, i64), ChangeStatus>,
}

pub type SharedServer = Arc<Mutex<ServerState>>;

pub fn new_server() -> SharedServer {
    Arc::new(Mutex::new(ServerState::default()))
}

impl ServerState {
    pub fn change_count(&self) -> usize {
        self.log.len()
    }

    fn upload(&mut self, source_id: &str, request: &UploadRequest) -> UploadResponse {
        let mut statuses = Vec::with_capacity(request.changes.len());
        for change in &request.changes {
            let idempotency_key = (source_id.to_string(), change.source_change_id);
            if let Some(status) = self.seen.get(&idempotency_key) {
                statuses.push(status.clone());
                continue;
            }
            let row_key = (change.table.clone(), change.pk.clone());
            let current = self.rows.get(&row_key).cloned();
            let current_version = current.as_ref().map(|r| r.server_version).unwrap_or(0);

            let status = if change.server_version != current_version {
                ChangeStatus {
                    source_change_id: change.source_change_id,
                    status: UploadStatusKind::Conflict,
                    new_server_version: None,
                    server_row: current.map(|r| ServerRow {
                        server_version: r.server_version,
                        deleted: r.deleted,
                        payload: r.payload,
                    }),
                    message: None,
                    invalid: None,
                }
            } else {
                let new_version = current_version + 1;
                let deleted = change.op == ChangeOp::Delete;
                let payload = if deleted { None } else { change.payload.clone() };
                self.rows.insert(
                    row_key,
                    ServerRowState {
                        server_version: new_version,
                        deleted,
                        payload: payload.clone(),
                    },
                );
                self.last_server_id += 1;
                self.log.push(ServerChange {
                    server_id: self.last_server_id,
                    schema: change.schema.clone(),
                    table: change.table.clone(),
                    op: change.op,
                    pk: change.pk.clone(),
                    payload,
                    server_version: new_version,
                    deleted,
                    source_id: source_id.to_string(),
                    source_change_id: change.source_change_id,
                    ts: "2024-01-01T00:00:00Z".to_string(),
                });
                ChangeStatus {
                    source_change_id: change.source_change_id,
                    status: UploadStatusKind::Applied,
                    new_server_version: Some(new_version),
                    server_row: None,
                    message: None,
                    invalid: None,
                }
            };
            self.seen.insert(idempotency_key, status.clone());
            statuses.push(status);
        }
        UploadResponse {
            accepted: true,
            highest_server_seq: self.last_server_id,
            statuses,
        }
    }

    fn download(
        &self,
        requester: &str,
        after: i64,
        limit: usize,
        include_self: bool,
        until: i64,
    ) -> DownloadResponse {
        let mut changes = Vec::new();
        let mut next_after = after;
        for entry in &self.log {
            if entry.server_id <= after {
                continue;
            }
            if until > 0 && entry.server_id > until {
                break;
            }
            if changes.len() == limit {
                break;
            }
            next_after = entry.server_id;
            if !include_self && entry.source_id == requester {
                continue;
            }
            changes.push(entry.clone());
        }
        let has_more = self.log.iter().any(|entry| {
            entry.server_id > next_after && (until == 0 || entry.server_id <= until)
        });
        DownloadResponse {
            changes,
            has_more,
            next_after,
            window_until: if until > 0 { until } else { self.last_server_id },
        }
    }
}

pub struct DeviceTransport {
    server: SharedServer,
    source_id: String,
    pub upload_calls: Arc<AtomicUsize>,
}

impl Transport for DeviceTransport {
    fn get(&self, url: &Url) -> Result<Response, TransportError> {
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let after = params.get("after").and_then(|v| v.parse().ok()).unwrap_or(0);
        let limit = params
            .get("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);
        let include_self = params.get("include_self").map(String::as_str) == Some("true");
        let until = params.get("until").and_then(|v| v.parse().ok()).unwrap_or(0);

        let page = self
            .server
            .lock()
            .unwrap()
            .download(&self.source_id, after, limit, include_self, until);
        Ok(Response {
            status: 200,
            body: serde_json::to_vec(&page).unwrap(),
        })
    }

    fn post_json(
        &self,
        _url: &Url,
        body: &serde_json::Value,
    ) -> Result<Response, TransportError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let request: UploadRequest = serde_json::from_value(body.clone()).unwrap();
        let response = self.server.lock().unwrap().upload(&self.source_id, &request);
        Ok(Response {
            status: 200,
            body: serde_json::to_vec(&response).unwrap(),
        })
    }
}

pub struct Device {
    pub store: SyncStore,
    pub source_id: String,
    pub upload_calls: Arc<AtomicUsize>,
}

pub fn new_device(server: &SharedServer, source_id: &str) -> Device {
    let config = SyncConfig::new(
        "app",
        vec![SyncedTable::new("users"), SyncedTable::new("files")],
    )
    .unwrap();
    let upload_calls = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(DeviceTransport {
        server: Arc::clone(server),
        source_id: source_id.to_string(),
        upload_calls: Arc::clone(&upload_calls),
    });
    let store = SyncStore::new_in_memory(
        config,
        Url::parse("http://sync.example.com").unwrap(),
        transport,
    )
    .unwrap();
    store
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE users (
                     id    TEXT PRIMARY KEY,
                     name  TEXT,
                     email TEXT
                 );
                 CREATE TABLE files (
                     id   BLOB PRIMARY KEY DEFAULT (randomblob(16)),
                     name TEXT,
                     data BLOB
                 );",
            )
        })
        .unwrap();
    store.bootstrap("user-1", source_id).unwrap();
    Device {
        store,
        source_id: source_id.to_string(),
        upload_calls,
    }
}

impl Device {
    pub fn insert_user(&self, id: &str, name: &str, email: &str) {
        self.store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO users (id, name, email) VALUES (?, ?, ?)",
                    [id, name, email],
                )
            })
            .unwrap();
    }

    pub fn update_user_name(&self, id: &str, name: &str) {
        self.store
            .with_connection(|conn| {
                conn.execute("UPDATE users SET name = ? WHERE id = ?", [name, id])
            })
            .unwrap();
    }

    pub fn delete_user(&self, id: &str) {
        self.store
            .with_connection(|conn| conn.execute("DELETE FROM users WHERE id = ?", [id]))
            .unwrap();
    }

    pub fn user(&self, id: &str) -> Option<(String, Option<String>)> {
        self.store
            .with_connection(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT name, email FROM users WHERE id = ?",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })
            .unwrap()
    }

    pub fn cursor(&self) -> i64 {
        self.store
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT last_server_seq_seen FROM sync_client_info",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap()
    }

    pub fn pending_count(&self) -> i64 {
        self.store
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sync_pending", [], |row| row.get(0))
            })
            .unwrap()
    }

    /// `(server_version, deleted)` from row metadata.
    pub fn row_meta(&self, table: &str, pk: &str) -> Option<(i64, bool)> {
        self.store
            .with_connection(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT server_version, deleted FROM sync_row_meta
                     WHERE table_name = ? AND pk_uuid = ?",
                    [table, pk],
                    |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
                )
                .optional()
            })
            .unwrap()
    }
}
