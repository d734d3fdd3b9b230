/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Upload rejected with HTTP status {status}: {body}")]
    UploadHttp { status: u16, body: String },

    #[error("Download rejected with HTTP status {status}: {body}")]
    DownloadHttp { status: u16, body: String },

    #[error("Network error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing URL: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] base16::DecodeError),

    #[error("Invalid schema name: {0:?}")]
    InvalidSchemaName(String),

    #[error("Table is not registered for syncing: {0:?}")]
    UnknownTable(String),

    #[error("Table has no usable sync key column: {0:?}")]
    NoKeyColumn(String),

    // A durability invariant was violated, e.g. the client-info row has gone
    // missing. The caller should bootstrap again.
    #[error("Sync metadata is missing or corrupt: {0}")]
    LocalInconsistency(String),
}

pub type Result<T> = std::result::Result<T, Error>;
