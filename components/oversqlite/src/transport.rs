/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The narrow seam between the engine and whatever does the actual HTTP.
//!
//! The engine only ever needs two verbs against the sync server: a JSON POST
//! (upload) and a GET (download). Implementations return every response they
//! get, success or not; interpreting the status code is the caller's job.
//! Tests plug in an in-process server, production uses `ReqwestTransport`.

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
}

pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub trait Transport: Send + Sync {
    fn get(&self, url: &Url) -> Result<Response, TransportError>;
    fn post_json(&self, url: &Url, body: &serde_json::Value) -> Result<Response, TransportError>;
}

#[cfg(feature = "reqwest-transport")]
pub use reqwest_backend::ReqwestTransport;

#[cfg(feature = "reqwest-transport")]
mod reqwest_backend {
    use super::{Response, Transport, TransportError};
    use url::Url;

    /// The stock blocking HTTP backend. Safe to share across threads; the
    /// engine only drives one request at a time anyway.
    pub struct ReqwestTransport {
        client: reqwest::blocking::Client,
        auth_token: Option<String>,
    }

    impl ReqwestTransport {
        pub fn new() -> Self {
            Self {
                client: reqwest::blocking::Client::new(),
                auth_token: None,
            }
        }

        /// Attach a bearer token to every request. Token acquisition and
        /// refresh live with the embedding application.
        pub fn with_auth_token(token: impl Into<String>) -> Self {
            Self {
                client: reqwest::blocking::Client::new(),
                auth_token: Some(token.into()),
            }
        }

        fn finish(
            &self,
            builder: reqwest::blocking::RequestBuilder,
        ) -> Result<Response, TransportError> {
            let builder = match &self.auth_token {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            };
            let response = builder
                .send()
                .map_err(|e| TransportError::Network(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .map_err(|e| TransportError::Network(e.to_string()))?
                .to_vec();
            Ok(Response { status, body })
        }
    }

    impl Default for ReqwestTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for ReqwestTransport {
        fn get(&self, url: &Url) -> Result<Response, TransportError> {
            self.finish(self.client.get(url.clone()))
        }

        fn post_json(
            &self,
            url: &Url,
            body: &serde_json::Value,
        ) -> Result<Response, TransportError> {
            self.finish(self.client.post(url.clone()).json(body))
        }
    }
}
