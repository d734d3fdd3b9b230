/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Wire shapes for the sync server's upload and download endpoints.
//!
//! Payloads travel as JSON objects keyed by lowercased column names. BLOB
//! values are Base64 on the wire (UUID primary keys travel as dashed UUID
//! strings); the local representation of both is lowercase hex. The payload
//! codec owns those conversions, this module is just the envelope.

use serde_derive::{Deserialize, Serialize};

pub type JsonObject = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeOp::Insert),
            "UPDATE" => Some(ChangeOp::Update),
            "DELETE" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued local change, as sent to `POST /sync/upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingChange {
    pub source_change_id: i64,
    pub schema: String,
    pub table: String,
    pub op: ChangeOp,
    pub pk: String,
    /// The version this change is based on (optimistic concurrency).
    pub server_version: i64,
    pub payload: Option<JsonObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub last_server_seq_seen: i64,
    pub changes: Vec<OutgoingChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatusKind {
    Applied,
    Conflict,
    Invalid,
    MaterializeError,
}

/// The server's image of a row, returned alongside a conflict verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRow {
    pub server_version: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub payload: Option<JsonObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub source_change_id: i64,
    pub status: UploadStatusKind,
    #[serde(default)]
    pub new_server_version: Option<i64>,
    #[serde(default)]
    pub server_row: Option<ServerRow>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub invalid: Option<serde_json::Value>,
}

impl ChangeStatus {
    /// The canonical reason string of an `invalid` verdict, if any.
    pub fn invalid_reason(&self) -> Option<String> {
        match &self.invalid {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub accepted: bool,
    pub highest_server_seq: i64,
    pub statuses: Vec<ChangeStatus>,
}

/// One entry of the per-user change log, as returned by
/// `GET /sync/download`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChange {
    pub server_id: i64,
    pub schema: String,
    pub table: String,
    pub op: ChangeOp,
    pub pk: String,
    #[serde(default)]
    pub payload: Option<JsonObject>,
    pub server_version: i64,
    #[serde(default)]
    pub deleted: bool,
    pub source_id: String,
    pub source_change_id: i64,
    #[serde(default)]
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub changes: Vec<ServerChange>,
    pub has_more: bool,
    pub next_after: i64,
    #[serde(default)]
    pub window_until: i64,
}

/// Canonical `invalid` reasons. Only `fk_missing` keeps the pending row
/// queued for a retry.
pub mod invalid_reason {
    pub const FK_MISSING: &str = "fk_missing";
    pub const BAD_PAYLOAD: &str = "bad_payload";
    pub const PRECHECK_ERROR: &str = "precheck_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNREGISTERED_TABLE: &str = "unregistered_table";
    pub const BATCH_TOO_LARGE: &str = "batch_too_large";
}
