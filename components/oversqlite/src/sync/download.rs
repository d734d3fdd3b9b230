/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Download: read the cursor, fetch a page, apply it atomically with the
//! capture triggers suppressed.
//!
//! The same apply path also serves the post-upload lookback drain, where it
//! runs with version guards so re-reading a range below the watermark can
//! never regress a row.

use crate::config::SyncConfig;
use crate::db::SyncDb;
use crate::error::*;
use crate::merge::{resolve_with_guardrails, ConflictResolver, MergeResult};
use crate::payload;
use crate::protocol::{ChangeOp, DownloadResponse, JsonObject, ServerChange, ServerRow};
use crate::transport::Transport;
use sql_support::ConnExt;
use std::collections::{BTreeSet, HashMap};
use url::Url;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchParams {
    pub after: i64,
    pub limit: usize,
    pub include_self: bool,
    pub until: i64,
}

/// Network phase. Runs without the store's gate.
pub(crate) fn fetch(
    transport: &dyn Transport,
    base_url: &Url,
    config: &SyncConfig,
    params: FetchParams,
) -> Result<DownloadResponse> {
    let mut url = base_url.join(&config.download_path)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("after", &params.after.to_string())
            .append_pair("limit", &params.limit.to_string())
            .append_pair("schema", &config.schema);
        if params.include_self {
            query.append_pair("include_self", "true");
        }
        if params.until > 0 {
            query.append_pair("until", &params.until.to_string());
        }
    }
    let response = transport.get(&url)?;
    if !response.is_success() {
        return Err(Error::DownloadHttp {
            status: response.status,
            body: response.text(),
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

#[derive(Debug, Default)]
pub(crate) struct ApplyOutcome {
    pub applied: usize,
    pub next_after: i64,
    pub touched: BTreeSet<String>,
}

/// A lookback page can carry several changes for one row, e.g. a DELETE
/// followed by a reinsert at a higher version. Drop any DELETE that a later
/// change for the same row supersedes, then order by ascending version, so
/// a stale DELETE can't undo the reinsert.
pub(crate) fn collapse_lookback_page(changes: &[ServerChange]) -> Vec<ServerChange> {
    let mut highest: HashMap<(&str, &str), i64> = HashMap::new();
    for change in changes {
        let entry = highest
            .entry((change.table.as_str(), change.pk.as_str()))
            .or_insert(change.server_version);
        *entry = (*entry).max(change.server_version);
    }
    let mut kept: Vec<ServerChange> = changes
        .iter()
        .filter(|change| {
            change.op != ChangeOp::Delete
                || highest[&(change.table.as_str(), change.pk.as_str())] <= change.server_version
        })
        .cloned()
        .collect();
    kept.sort_by_key(|change| (change.server_version, change.server_id));
    kept
}

/// DB phase: apply one page in a single transaction and advance the cursor
/// with it.
pub(crate) fn apply(
    db: &SyncDb,
    config: &SyncConfig,
    resolver: &dyn ConflictResolver,
    page: &DownloadResponse,
    include_self: bool,
    is_post_upload_lookback: bool,
) -> Result<ApplyOutcome> {
    let tx = db.unchecked_transaction()?;
    db.set_apply_mode(true)?;
    // Pages are ordered but not topologically sorted across tables.
    tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;

    let info = db.client_info()?;
    let mut outcome = ApplyOutcome {
        next_after: info.last_server_seq_seen,
        ..ApplyOutcome::default()
    };

    if page.changes.is_empty() {
        if page.next_after >= info.last_server_seq_seen {
            db.set_last_server_seq_seen(page.next_after)?;
            outcome.next_after = page.next_after;
        }
        db.set_apply_mode(false)?;
        tx.commit()?;
        return Ok(outcome);
    }

    let collapsed;
    let changes: &[ServerChange] = if is_post_upload_lookback {
        collapsed = collapse_lookback_page(&page.changes);
        &collapsed
    } else {
        &page.changes
    };

    for change in changes {
        outcome.touched.insert(change.table.clone());
        if !include_self && change.source_id == info.source_id {
            continue;
        }
        let key_override = config
            .table(&change.table)
            .and_then(|t| t.sync_key_column_name.as_deref());
        let table_info = match db.table_info(&change.table, key_override) {
            Ok(info) => info,
            Err(Error::UnknownTable(table)) => {
                log::warn!("Server sent a change for unknown table {:?}; skipping", table);
                continue;
            }
            Err(e) => return Err(e),
        };
        let pk_uuid = payload::wire_pk_to_local(&change.pk, table_info.key_is_blob);
        if config.verbose_logs {
            log::debug!(
                "Applying {} {}/{} (server id {}, version {})",
                change.op,
                change.table,
                pk_uuid,
                change.server_id,
                change.server_version
            );
        }

        match change.op {
            ChangeOp::Delete => {
                let local_version = db
                    .row_meta(&change.table, &pk_uuid)?
                    .map(|meta| meta.server_version)
                    .unwrap_or(0);
                if is_post_upload_lookback && change.server_version <= local_version {
                    outcome.applied += 1;
                    continue;
                }
                payload::delete_business_row(&db.db, &table_info, &pk_uuid)?;
                db.put_row_meta(&change.table, &pk_uuid, change.server_version, true)?;
            }
            ChangeOp::Insert | ChangeOp::Update => {
                apply_upsert_change(
                    db,
                    resolver,
                    &table_info,
                    change,
                    &pk_uuid,
                    is_post_upload_lookback,
                )?;
            }
        }
        outcome.applied += 1;
    }

    db.set_last_server_seq_seen(page.next_after)?;
    outcome.next_after = page.next_after;
    db.set_apply_mode(false)?;
    tx.commit()?;
    Ok(outcome)
}

/// The collision ladder for an incoming INSERT/UPDATE.
fn apply_upsert_change(
    db: &SyncDb,
    resolver: &dyn ConflictResolver,
    table_info: &crate::table_info::TableInfo,
    change: &ServerChange,
    pk_uuid: &str,
    is_post_upload_lookback: bool,
) -> Result<()> {
    let table = &change.table;
    let version = change.server_version;
    let meta = db.row_meta(table, pk_uuid)?;
    let local_version = meta.as_ref().map(|m| m.server_version).unwrap_or(0);

    // A lookback pass re-reads a range we may have partly seen (including
    // our own uploads); anything at or below the version we already track
    // must not touch the row.
    if is_post_upload_lookback && version <= local_version {
        return Ok(());
    }

    let pending = db.pending_row(table, pk_uuid)?;

    // 1. A pending local DELETE wins over the incoming row.
    if matches!(&pending, Some(p) if p.op == ChangeOp::Delete) {
        db.put_row_meta(table, pk_uuid, version, true)?;
        return Ok(());
    }
    // 2. Recently deleted here, and the server hasn't moved past what we saw.
    if meta.as_ref().map(|m| m.deleted).unwrap_or(false) && version <= local_version {
        db.put_row_meta(table, pk_uuid, version, true)?;
        return Ok(());
    }

    let incoming: Option<JsonObject> = change
        .payload
        .as_ref()
        .map(|p| payload::wire_image_to_local(table_info, p))
        .transpose()?;

    // 3. A pending local edit: a genuine concurrent-edit conflict.
    if let Some(pending) = pending {
        let local_payload: Option<JsonObject> = pending
            .payload
            .as_deref()
            .map(payload::parse_local_image)
            .transpose()?;
        let server_row = ServerRow {
            server_version: version,
            deleted: false,
            payload: incoming.clone(),
        };
        match resolve_with_guardrails(
            resolver,
            table,
            pk_uuid,
            false,
            Some(&server_row),
            local_payload.as_ref(),
        ) {
            MergeResult::AcceptServer => {
                if let Some(image) = &incoming {
                    payload::upsert_business_row(&db.db, table_info, pk_uuid, image)?;
                }
                db.put_row_meta(table, pk_uuid, version, false)?;
                db.delete_pending(table, pk_uuid)?;
            }
            MergeResult::KeepLocal(merged) => {
                let merged = merged.or(local_payload);
                if let Some(image) = &merged {
                    payload::upsert_business_row(&db.db, table_info, pk_uuid, image)?;
                }
                db.put_row_meta(table, pk_uuid, version, false)?;
                db.rewrite_pending(
                    table,
                    pk_uuid,
                    ChangeOp::Update,
                    version,
                    merged
                        .map(|m| serde_json::to_string(&m))
                        .transpose()?
                        .as_deref(),
                )?;
            }
        }
        return Ok(());
    }

    // 4. No local pending: a plain apply.
    if let Some(image) = &incoming {
        payload::upsert_business_row(&db.db, table_info, pk_uuid, image)?;
    }
    db.put_row_meta(table, pk_uuid, version, false)?;
    Ok(())
}
