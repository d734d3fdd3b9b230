/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Upload: prepare (read the queue, assign change ids), perform (one POST),
//! finalize (apply the server's verdicts).
//!
//! Prepare never commits anything the server hasn't seen, and finalize runs
//! in a single transaction, so a failure at any point leaves the queue
//! intact and the whole call safe to retry. The server dedupes replays on
//! `(source_id, source_change_id)`.

use crate::config::SyncConfig;
use crate::db::SyncDb;
use crate::error::*;
use crate::merge::{resolve_with_guardrails, ConflictResolver, MergeResult};
use crate::payload;
use crate::protocol::{
    invalid_reason, ChangeOp, JsonObject, OutgoingChange, ServerRow, UploadRequest,
    UploadResponse, UploadStatusKind,
};
use crate::transport::Transport;
use sql_support::ConnExt;
use std::collections::BTreeSet;
use url::Url;

/// Per-call accounting, one bucket per server verdict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadSummary {
    pub total: usize,
    pub applied: usize,
    pub conflict: usize,
    pub invalid: usize,
    pub materialize_error: usize,
    pub invalid_reasons: Vec<String>,
    pub first_error_message: Option<String>,
}

/// What we actually sent, kept around so finalize can pair the server's
/// statuses (by position) with local queue rows.
#[derive(Debug, Clone)]
pub(crate) struct SentChange {
    pub table: String,
    pub pk_uuid: String,
    pub op: ChangeOp,
    pub change_id: i64,
    pub base_version: i64,
    pub local_payload: Option<JsonObject>,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedBatch {
    pub request: UploadRequest,
    pub sent: Vec<SentChange>,
}

/// DB phase. Returns `None` when the queue is empty, in which case no
/// network call should be made at all.
pub(crate) fn prepare(db: &SyncDb, config: &SyncConfig) -> Result<Option<PreparedBatch>> {
    let tx = db.unchecked_transaction()?;
    let info = db.client_info()?;
    let rows = db.pending_rows(config.upload_limit)?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut next_change_id = info.next_change_id;
    let mut changes = Vec::with_capacity(rows.len());
    let mut sent = Vec::with_capacity(rows.len());
    for row in rows {
        let key_override = config
            .table(&row.table_name)
            .and_then(|t| t.sync_key_column_name.as_deref());
        let table_info = db.table_info(&row.table_name, key_override)?;

        let change_id = match row.change_id {
            Some(id) => id,
            None => {
                let id = next_change_id;
                next_change_id += 1;
                db.assign_pending_change_id(&row.table_name, &row.pk_uuid, id)?;
                id
            }
        };

        let local_payload: Option<JsonObject> = match &row.payload {
            Some(text) => Some(payload::parse_local_image(text)?),
            // Can happen after a restart; the business row is authoritative.
            None if row.op != ChangeOp::Delete => {
                match payload::read_row_image(&db.db, &table_info, &row.pk_uuid)? {
                    Some(image) => Some(image),
                    None => {
                        log::warn!(
                            "Pending {} for {}/{} has no payload and no row; dropping it",
                            row.op,
                            row.table_name,
                            row.pk_uuid
                        );
                        db.delete_pending(&row.table_name, &row.pk_uuid)?;
                        continue;
                    }
                }
            }
            None => None,
        };

        if config.verbose_logs {
            log::debug!(
                "Uploading {} {}/{} (change {}, base {}): {:?}",
                row.op,
                row.table_name,
                row.pk_uuid,
                change_id,
                row.base_version,
                local_payload
            );
        }

        let wire_payload = local_payload
            .as_ref()
            .map(|image| payload::local_image_to_wire(&table_info, image))
            .transpose()?;
        changes.push(OutgoingChange {
            source_change_id: change_id,
            schema: config.schema.clone(),
            table: row.table_name.clone(),
            op: row.op,
            pk: payload::local_pk_to_wire(&row.pk_uuid, table_info.key_is_blob),
            server_version: row.base_version,
            payload: wire_payload,
        });
        sent.push(SentChange {
            table: row.table_name,
            pk_uuid: row.pk_uuid,
            op: row.op,
            change_id,
            base_version: row.base_version,
            local_payload,
        });
    }
    db.set_next_change_id_at_least(next_change_id)?;
    tx.commit()?;

    if changes.is_empty() {
        return Ok(None);
    }
    Ok(Some(PreparedBatch {
        request: UploadRequest {
            last_server_seq_seen: info.last_server_seq_seen,
            changes,
        },
        sent,
    }))
}

/// Network phase. Runs without the store's gate.
pub(crate) fn perform(
    transport: &dyn Transport,
    base_url: &Url,
    config: &SyncConfig,
    request: &UploadRequest,
) -> Result<UploadResponse> {
    let url = base_url.join(&config.upload_path)?;
    let response = transport.post_json(&url, &serde_json::to_value(request)?)?;
    if !response.is_success() {
        return Err(Error::UploadHttp {
            status: response.status,
            body: response.text(),
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

/// DB phase: apply the server's verdicts in one transaction. The capture
/// triggers are suppressed for the duration since every business-table
/// write here is the server's authoritative image, not a new local change.
pub(crate) fn finalize(
    db: &SyncDb,
    config: &SyncConfig,
    resolver: &dyn ConflictResolver,
    batch: &PreparedBatch,
    response: &UploadResponse,
) -> Result<(UploadSummary, BTreeSet<String>)> {
    if batch.sent.len() != response.statuses.len() {
        log::warn!(
            "Server returned {} statuses for {} changes",
            response.statuses.len(),
            batch.sent.len()
        );
    }

    let tx = db.unchecked_transaction()?;
    db.set_apply_mode(true)?;
    let info = db.client_info()?;
    // A watermark for the lookback drain, never a download cursor.
    db.set_last_server_seq_seen(info.last_server_seq_seen.max(response.highest_server_seq))?;

    let mut summary = UploadSummary {
        total: batch.sent.len(),
        ..UploadSummary::default()
    };
    let mut touched = BTreeSet::new();

    for (sent, status) in batch.sent.iter().zip(response.statuses.iter()) {
        if sent.change_id != status.source_change_id {
            log::warn!(
                "Status for change {} arrived out of order (expected {})",
                status.source_change_id,
                sent.change_id
            );
        }
        let key_override = config
            .table(&sent.table)
            .and_then(|t| t.sync_key_column_name.as_deref());
        let table_info = db.table_info(&sent.table, key_override)?;

        match status.status {
            UploadStatusKind::Applied => {
                summary.applied += 1;
                if sent.op != ChangeOp::Delete {
                    if let Some(image) = &sent.local_payload {
                        // Idempotent re-apply, so the local row matches what
                        // the server materialized.
                        payload::upsert_business_row(&db.db, &table_info, &sent.pk_uuid, image)?;
                        touched.insert(sent.table.clone());
                    }
                }
                db.delete_pending_if_unchanged(&sent.table, &sent.pk_uuid, sent.change_id)?;
                let new_version = status
                    .new_server_version
                    .unwrap_or(sent.base_version + 1);
                db.put_row_meta(
                    &sent.table,
                    &sent.pk_uuid,
                    new_version,
                    sent.op == ChangeOp::Delete,
                )?;
            }
            UploadStatusKind::Conflict => {
                summary.conflict += 1;
                // The server row's payload is in wire form; resolvers work
                // on local images.
                let server_row = match &status.server_row {
                    Some(row) => Some(ServerRow {
                        server_version: row.server_version,
                        deleted: row.deleted,
                        payload: row
                            .payload
                            .as_ref()
                            .map(|p| payload::wire_image_to_local(&table_info, p))
                            .transpose()?,
                    }),
                    None => None,
                };
                let decision = resolve_with_guardrails(
                    resolver,
                    &sent.table,
                    &sent.pk_uuid,
                    sent.op == ChangeOp::Delete,
                    server_row.as_ref(),
                    sent.local_payload.as_ref(),
                );
                match decision {
                    MergeResult::AcceptServer => {
                        match &server_row {
                            Some(row) => {
                                if row.deleted {
                                    payload::delete_business_row(
                                        &db.db,
                                        &table_info,
                                        &sent.pk_uuid,
                                    )?;
                                } else if let Some(image) = &row.payload {
                                    payload::upsert_business_row(
                                        &db.db,
                                        &table_info,
                                        &sent.pk_uuid,
                                        image,
                                    )?;
                                } else {
                                    // A live server row should carry its
                                    // payload; leave the local row alone.
                                    log::warn!(
                                        "Conflict for {}/{}: server row is not deleted but has no payload",
                                        sent.table,
                                        sent.pk_uuid
                                    );
                                }
                                db.put_row_meta(
                                    &sent.table,
                                    &sent.pk_uuid,
                                    row.server_version,
                                    row.deleted,
                                )?;
                            }
                            // The guardrails keep the local payload when the
                            // server sent no row, so this arm shouldn't run.
                            None => log::warn!(
                                "Conflict for {}/{} with no server row",
                                sent.table,
                                sent.pk_uuid
                            ),
                        }
                        touched.insert(sent.table.clone());
                        db.delete_pending_if_unchanged(&sent.table, &sent.pk_uuid, sent.change_id)?;
                    }
                    MergeResult::KeepLocal(merged) => {
                        let server_version = server_row
                            .as_ref()
                            .map(|row| row.server_version)
                            .unwrap_or(sent.base_version);
                        if sent.op == ChangeOp::Delete {
                            // The local deletion stands and re-uploads with
                            // the version we just learned.
                            payload::delete_business_row(&db.db, &table_info, &sent.pk_uuid)?;
                            db.put_row_meta(&sent.table, &sent.pk_uuid, server_version, true)?;
                            db.rewrite_pending(
                                &sent.table,
                                &sent.pk_uuid,
                                ChangeOp::Delete,
                                server_version,
                                None,
                            )?;
                        } else {
                            let merged = match merged.or_else(|| sent.local_payload.clone()) {
                                Some(merged) => merged,
                                None => {
                                    db.delete_pending_if_unchanged(
                                        &sent.table,
                                        &sent.pk_uuid,
                                        sent.change_id,
                                    )?;
                                    continue;
                                }
                            };
                            payload::upsert_business_row(
                                &db.db,
                                &table_info,
                                &sent.pk_uuid,
                                &merged,
                            )?;
                            db.put_row_meta(&sent.table, &sent.pk_uuid, server_version, false)?;
                            let merged_text = serde_json::to_string(&merged)?;
                            db.rewrite_pending(
                                &sent.table,
                                &sent.pk_uuid,
                                ChangeOp::Update,
                                server_version,
                                Some(merged_text.as_str()),
                            )?;
                            touched.insert(sent.table.clone());
                        }
                    }
                }
            }
            UploadStatusKind::Invalid => {
                summary.invalid += 1;
                let reason = status
                    .invalid_reason()
                    .unwrap_or_else(|| "unknown".to_string());
                // `fk_missing` is usually ordering within our own queue;
                // the next upload retries it.
                if reason != invalid_reason::FK_MISSING {
                    db.delete_pending_if_unchanged(&sent.table, &sent.pk_uuid, sent.change_id)?;
                }
                summary.invalid_reasons.push(reason);
            }
            UploadStatusKind::MaterializeError => {
                summary.materialize_error += 1;
                if summary.first_error_message.is_none() {
                    summary.first_error_message = status.message.clone();
                }
            }
        }
    }

    db.set_apply_mode(false)?;
    tx.commit()?;
    Ok((summary, touched))
}
