/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict resolution.
//!
//! The engine only ever arbitrates "accept the server's row" against "keep
//! (a merge of) the local one"; anything richer is the resolver's business.
//! Both payloads handed to a resolver are in the local image form (hex
//! blobs, lowercase keys), so implementations get a stable comparison
//! surface regardless of what travelled on the wire. `server_version` is
//! deliberately not part of that surface.

use crate::protocol::{JsonObject, ServerRow};

#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    /// Materialize the server row locally and drop the local change.
    AcceptServer,
    /// Keep the given payload locally and re-upload it against the server's
    /// version. `None` preserves a local DELETE.
    KeepLocal(Option<JsonObject>),
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        table: &str,
        pk: &str,
        server_row: &ServerRow,
        local_payload: Option<&JsonObject>,
    ) -> MergeResult;
}

/// The default policy.
pub struct ServerWins;

impl ConflictResolver for ServerWins {
    fn resolve(
        &self,
        _table: &str,
        _pk: &str,
        _server_row: &ServerRow,
        _local_payload: Option<&JsonObject>,
    ) -> MergeResult {
        MergeResult::AcceptServer
    }
}

/// A deterministic policy for symmetric conflicts: both sides serialize the
/// two payloads and the lexicographically greater one wins, so two devices
/// resolving the same pair independently reach the same row.
/// (`serde_json`'s object maps serialize with sorted keys, which makes the
/// comparison canonical.)
pub struct LexicographicWins;

impl ConflictResolver for LexicographicWins {
    fn resolve(
        &self,
        _table: &str,
        _pk: &str,
        server_row: &ServerRow,
        local_payload: Option<&JsonObject>,
    ) -> MergeResult {
        let local = match local_payload {
            Some(local) => local,
            None => return MergeResult::AcceptServer,
        };
        let server = match &server_row.payload {
            Some(server) => server,
            None => return MergeResult::KeepLocal(Some(local.clone())),
        };
        let local_text = serde_json::to_string(local).unwrap_or_default();
        let server_text = serde_json::to_string(server).unwrap_or_default();
        if local_text > server_text {
            MergeResult::KeepLocal(Some(local.clone()))
        } else {
            MergeResult::AcceptServer
        }
    }
}

/// Engine-side guardrails, applied in order before any resolver runs:
///
/// - a local DELETE is never merged away; it re-uploads against the new
///   server version;
/// - a missing local payload (non-DELETE) can only accept the server;
/// - a missing server row can only keep the local payload.
pub(crate) fn resolve_with_guardrails(
    resolver: &dyn ConflictResolver,
    table: &str,
    pk: &str,
    local_is_delete: bool,
    server_row: Option<&ServerRow>,
    local_payload: Option<&JsonObject>,
) -> MergeResult {
    if local_is_delete {
        return MergeResult::KeepLocal(local_payload.cloned());
    }
    if local_payload.is_none() {
        return MergeResult::AcceptServer;
    }
    let server_row = match server_row {
        Some(row) => row,
        None => return MergeResult::KeepLocal(local_payload.cloned()),
    };
    resolver.resolve(table, pk, server_row, local_payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> JsonObject {
        serde_json::from_value(value).unwrap()
    }

    fn server_row(payload: Option<JsonObject>) -> ServerRow {
        ServerRow {
            server_version: 2,
            deleted: false,
            payload,
        }
    }

    #[test]
    fn test_guardrails() {
        let local = obj(json!({"id": "u1", "name": "local"}));
        // local DELETE always survives
        assert_eq!(
            resolve_with_guardrails(
                &ServerWins,
                "users",
                "u1",
                true,
                Some(&server_row(None)),
                None
            ),
            MergeResult::KeepLocal(None)
        );
        // missing local payload defaults to the server
        assert_eq!(
            resolve_with_guardrails(
                &LexicographicWins,
                "users",
                "u1",
                false,
                Some(&server_row(Some(local.clone()))),
                None
            ),
            MergeResult::AcceptServer
        );
        // missing server row keeps the local payload
        assert_eq!(
            resolve_with_guardrails(&ServerWins, "users", "u1", false, None, Some(&local)),
            MergeResult::KeepLocal(Some(local))
        );
        // with neither side present (non-DELETE), the missing local payload
        // check wins and we default to the server
        assert_eq!(
            resolve_with_guardrails(&ServerWins, "users", "u1", false, None, None),
            MergeResult::AcceptServer
        );
    }

    #[test]
    fn test_lexicographic_is_symmetric() {
        let a = obj(json!({"id": "u1", "name": "aaa"}));
        let b = obj(json!({"id": "u1", "name": "zzz"}));

        // Device holding `a` locally, seeing `b` from the server:
        let from_a = LexicographicWins.resolve("users", "u1", &server_row(Some(b.clone())), Some(&a));
        // Device holding `b` locally, seeing `a` from the server:
        let from_b = LexicographicWins.resolve("users", "u1", &server_row(Some(a.clone())), Some(&b));

        // Both pick the same winner: `b`.
        assert_eq!(from_a, MergeResult::AcceptServer);
        assert_eq!(from_b, MergeResult::KeepLocal(Some(b)));
    }

    #[test]
    fn test_server_wins_default() {
        let local = obj(json!({"id": "u1", "name": "local"}));
        assert_eq!(
            ServerWins.resolve("users", "u1", &server_row(None), Some(&local)),
            MergeResult::AcceptServer
        );
    }
}
