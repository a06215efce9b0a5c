//! HTTP transport shared by all request/response operations of the SDK.
//!
//! The transport owns the normalized base URL and the bearer credential. It
//! is deliberately small: every endpoint is plain JSON over `reqwest`, so the
//! interesting part is the uniform error mapping — network failures become
//! [`Error::Connection`], non-2xx responses become [`Error::Api`] with the
//! server's structured code, and 2xx bodies that fail the response schema
//! become [`Error::Schema`] because they indicate a contract violation
//! rather than a flaky network.

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use starcite_types::api::v1::ApiErrorBody;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;

/// The error code servers use for an expired session token.
const TOKEN_EXPIRED_CODE: &str = "token_expired";

pub(crate) struct HttpTransport {
    base_url: String,
    bearer: Option<SecretString>,
    http: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport for the given base URL.
    ///
    /// The URL must be `http(s)://`; trailing slashes are stripped and the
    /// `/v1` prefix is appended unless it is already the final segment.
    pub(crate) fn new(base_url: &str, bearer: Option<SecretString>) -> Result<Self, Error> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            bearer,
            http: reqwest::Client::new(),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The websocket flavor of the base URL (`ws://…/v1` or `wss://…/v1`).
    pub(crate) fn ws_base_url(&self) -> String {
        if let Some(rest) = self.base_url.strip_prefix("https") {
            format!("wss{rest}")
        } else {
            let rest = self.base_url.strip_prefix("http").expect("base url is http(s)");
            format!("ws{rest}")
        }
    }

    pub(crate) fn bearer(&self) -> Option<&SecretString> {
        self.bearer.as_ref()
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, Error> {
        self.request(Method::GET, path, query, None::<&()>, None)
            .await?
            .ok_or_else(|| Error::Schema(format!("empty response from GET {path}")))
    }

    pub(crate) async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        self.request(Method::POST, path, &[], Some(body), None)
            .await?
            .ok_or_else(|| Error::Schema(format!("empty response from POST {path}")))
    }

    /// Like [`HttpTransport::post`] but gives up early when `cancel` fires.
    pub(crate) async fn post_with_cancel<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, Error> {
        self.request(Method::POST, path, &[], Some(body), Some(cancel))
            .await?
            .ok_or_else(|| Error::Schema(format!("empty response from POST {path}")))
    }

    /// One request/response round-trip. Returns `Ok(None)` on 204.
    #[instrument(level = "trace", skip_all, fields(path = path))]
    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&B>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<T>, Error> {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.http.request(method, &url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(bearer) = &self.bearer {
            builder = builder.bearer_auth(bearer.expose_secret());
        }
        if let Some(body) = body {
            // sets Content-Type: application/json
            builder = builder.json(body);
        }

        let sent = builder.send();
        let response = match cancel {
            Some(cancel) => tokio::select! {
                response = sent => response,
                _ = cancel.cancelled() => {
                    return Err(Error::Connection(format!(
                        "request to {} was aborted",
                        self.base_url
                    )));
                }
            },
            None => sent.await,
        };
        let response = response.map_err(|err| {
            Error::Connection(format!("request to {} failed: {err}", self.base_url))
        })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(|err| {
            Error::Connection(format!(
                "could not read response body from {}: {err}",
                self.base_url
            ))
        })?;

        if !status.is_success() {
            return Err(self.map_api_error(status, &bytes));
        }

        // A 2xx with a non-JSON body means we are not talking to a Starcite
        // server; a JSON body of the wrong shape is a contract violation.
        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
            Error::Connection(format!(
                "non-JSON response body from {}: {err}",
                self.base_url
            ))
        })?;
        let parsed = serde_json::from_value(value).map_err(|err| Error::Schema(err.to_string()))?;
        Ok(Some(parsed))
    }

    fn map_api_error(&self, status: StatusCode, bytes: &[u8]) -> Error {
        let payload: Option<serde_json::Value> = serde_json::from_slice(bytes).ok();
        let envelope = payload
            .as_ref()
            .and_then(|value| serde_json::from_value::<ApiErrorBody>(value.clone()).ok());
        let code = envelope
            .as_ref()
            .map(|body| body.error.code().to_owned())
            .unwrap_or_else(|| format!("http_{}", status.as_u16()));
        let message = envelope
            .as_ref()
            .and_then(|body| body.error.message().map(str::to_owned))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_owned()
            });
        tracing::debug!("api error from {}: {status} {code}", self.base_url);
        if code == TOKEN_EXPIRED_CODE {
            return Error::TokenExpired;
        }
        Error::Api {
            status: status.as_u16(),
            code,
            message,
            payload,
        }
    }
}

/// Normalizes a user-supplied base URL to `<scheme>://<host>[:<port>]/v1`.
fn normalize_base_url(input: &str) -> Result<String, Error> {
    if !input.starts_with("http://") && !input.starts_with("https://") {
        return Err(Error::Config(format!(
            "base url must be http(s)://, got: {input}"
        )));
    }
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        Ok(trimmed.to_owned())
    } else {
        Ok(format!("{trimmed}/v1"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::normalize_base_url;

    #[test]
    fn appends_v1_and_strips_trailing_slashes() {
        assert_eq!(
            normalize_base_url("http://localhost:4800").unwrap(),
            "http://localhost:4800/v1"
        );
        assert_eq!(
            normalize_base_url("https://api.starcite.dev///").unwrap(),
            "https://api.starcite.dev/v1"
        );
        assert_eq!(
            normalize_base_url("http://localhost:4800/v1/").unwrap(),
            "http://localhost:4800/v1"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(normalize_base_url("ftp://localhost").is_err());
        assert!(normalize_base_url("localhost:4800").is_err());
    }

    #[test]
    fn ws_base_url_swaps_the_scheme() {
        let transport = super::HttpTransport::new("http://localhost:4800", None).unwrap();
        assert_eq!(transport.ws_base_url(), "ws://localhost:4800/v1");
        let transport = super::HttpTransport::new("https://api.starcite.dev", None).unwrap();
        assert_eq!(transport.ws_base_url(), "wss://api.starcite.dev/v1");
    }
}
