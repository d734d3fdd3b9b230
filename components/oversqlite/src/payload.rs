/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Row payload codec.
//!
//! A row travels in two JSON forms:
//!
//! - the *local image*, produced by the capture triggers and stored in
//!   `sync_pending.payload`: lowercased column keys, BLOB values as
//!   lowercase hex;
//!
//! - the *wire image*, sent to and received from the server: BLOB values as
//!   Base64, except a BLOB primary key which travels as the dashed UUID
//!   string (matching the `pk` field).
//!
//! This module converts between the two and between local images and actual
//! business rows.

use crate::error::*;
use crate::protocol::JsonObject;
use crate::table_info::TableInfo;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value as JsonValue;

// Peers are not required to pad, so decode either way.
const WIRE_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub(crate) fn parse_local_image(s: &str) -> Result<JsonObject> {
    Ok(serde_json::from_str(s)?)
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `32 lowercase hex chars -> 8-4-4-4-12`. `None` when the input isn't a
/// UUID-sized hex string.
pub fn hex_to_dashed_uuid(hex: &str) -> Option<String> {
    if hex.len() != 32 || !is_lower_hex(hex) {
        return None;
    }
    Some(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

/// Dashed (or bare) UUID string back to 32 lowercase hex chars. `None` when
/// the input isn't hex once the dashes are gone.
pub fn dashed_uuid_to_hex(s: &str) -> Option<String> {
    let hex: String = s.chars().filter(|c| *c != '-').collect::<String>().to_lowercase();
    if hex.len() == 32 && is_lower_hex(&hex) {
        Some(hex)
    } else {
        None
    }
}

/// Local canonical pk -> wire pk.
pub(crate) fn local_pk_to_wire(pk_uuid: &str, key_is_blob: bool) -> String {
    if key_is_blob {
        // Non-16-byte blob keys travel as bare hex; degenerate but it
        // round-trips.
        hex_to_dashed_uuid(pk_uuid).unwrap_or_else(|| pk_uuid.to_lowercase())
    } else {
        pk_uuid.to_string()
    }
}

/// Wire pk -> local canonical pk.
pub(crate) fn wire_pk_to_local(pk: &str, key_is_blob: bool) -> String {
    if key_is_blob {
        dashed_uuid_to_hex(pk).unwrap_or_else(|| pk.to_lowercase())
    } else {
        pk.to_string()
    }
}

pub(crate) fn local_image_to_wire(info: &TableInfo, image: &JsonObject) -> Result<JsonObject> {
    let mut out = JsonObject::new();
    for (key, value) in image {
        let key = key.to_lowercase();
        let converted = match (info.column(&key), value) {
            (Some(col), JsonValue::String(s)) if col.is_blob() => {
                if col.name == info.key_column {
                    JsonValue::String(local_pk_to_wire(s, true))
                } else {
                    JsonValue::String(WIRE_BASE64.encode(base16::decode(s)?))
                }
            }
            _ => value.clone(),
        };
        out.insert(key, converted);
    }
    Ok(out)
}

pub(crate) fn wire_image_to_local(info: &TableInfo, image: &JsonObject) -> Result<JsonObject> {
    let mut out = JsonObject::new();
    for (key, value) in image {
        let key = key.to_lowercase();
        let converted = match (info.column(&key), value) {
            (Some(col), JsonValue::String(s)) if col.is_blob() => {
                if col.name == info.key_column {
                    JsonValue::String(wire_pk_to_local(s, true))
                } else {
                    JsonValue::String(base16::encode_lower(&WIRE_BASE64.decode(s)?))
                }
            }
            _ => value.clone(),
        };
        out.insert(key, converted);
    }
    Ok(out)
}

/// The sync key in the form it is bound into business-table SQL.
pub(crate) fn key_to_sql(info: &TableInfo, pk_uuid: &str) -> Result<SqlValue> {
    if info.key_is_blob {
        Ok(SqlValue::Blob(base16::decode(pk_uuid)?))
    } else {
        Ok(SqlValue::Text(pk_uuid.to_string()))
    }
}

fn json_to_sql(is_blob: bool, value: &JsonValue) -> Result<SqlValue> {
    Ok(match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(s) => {
            if is_blob {
                SqlValue::Blob(base16::decode(s)?)
            } else {
                SqlValue::Text(s.clone())
            }
        }
        // Nested structures are stored as their JSON text.
        other => SqlValue::Text(other.to_string()),
    })
}

fn sql_to_json(is_blob: bool, value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(t) => {
            if is_blob {
                JsonValue::String(base16::encode_lower(t))
            } else {
                JsonValue::String(String::from_utf8_lossy(t).into_owned())
            }
        }
        ValueRef::Blob(b) => JsonValue::String(base16::encode_lower(b)),
    }
}

/// Rebuild the local image of a business row, the same shape the capture
/// triggers produce. `None` when the row no longer exists.
pub(crate) fn read_row_image(
    conn: &Connection,
    info: &TableInfo,
    pk_uuid: &str,
) -> Result<Option<JsonObject>> {
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE \"{}\" = ?",
        info.name, info.key_column
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_lowercase())
        .collect();
    let mut rows = stmt.query([key_to_sql(info, pk_uuid)?])?;
    let row = match rows.next()? {
        None => return Ok(None),
        Some(row) => row,
    };
    let mut image = JsonObject::new();
    for (i, name) in column_names.iter().enumerate() {
        let is_blob = info.column(name).map(|c| c.is_blob()).unwrap_or(false);
        image.insert(name.clone(), sql_to_json(is_blob, row.get_ref(i)?));
    }
    Ok(Some(image))
}

/// Write a local image into the business table as an idempotent upsert.
/// Callers run this with `apply_mode` set so the capture triggers stay out
/// of the way.
pub(crate) fn upsert_business_row(
    conn: &Connection,
    info: &TableInfo,
    pk_uuid: &str,
    image: &JsonObject,
) -> Result<()> {
    for key in image.keys() {
        if info.column(&key.to_lowercase()).is_none() {
            log::warn!(
                "Payload for {} carries unknown column {:?}; ignoring it",
                info.name,
                key
            );
        }
    }
    let cols: Vec<_> = info
        .columns
        .iter()
        .filter(|c| c.name == info.key_column || image.contains_key(&c.name))
        .collect();
    let mut params: Vec<SqlValue> = Vec::with_capacity(cols.len());
    for col in &cols {
        let value = match image.get(&col.name) {
            Some(value) if col.name != info.key_column => json_to_sql(col.is_blob(), value)?,
            // The key always comes from the canonical pk, not the payload.
            _ => key_to_sql(info, pk_uuid)?,
        };
        params.push(value);
    }

    let col_list = cols
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; cols.len()].join(", ");
    let updates = cols
        .iter()
        .filter(|c| c.name != info.key_column)
        .map(|c| format!("\"{0}\" = excluded.\"{0}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = if updates.is_empty() {
        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"{}\") DO NOTHING",
            info.name, col_list, placeholders, info.key_column
        )
    } else {
        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"{}\") DO UPDATE SET {}",
            info.name, col_list, placeholders, info.key_column, updates
        )
    };
    conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(())
}

pub(crate) fn delete_business_row(
    conn: &Connection,
    info: &TableInfo,
    pk_uuid: &str,
) -> Result<()> {
    let sql = format!(
        "DELETE FROM \"{}\" WHERE \"{}\" = ?",
        info.name, info.key_column
    );
    conn.prepare_cached(&sql)?
        .execute([key_to_sql(info, pk_uuid)?])?;
    Ok(())
}
