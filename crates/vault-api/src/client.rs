//! HTTP client for a Vault server.

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use vault_core::{RootToken, VaultConfig};

use crate::sys::{AuthToken, Sys};

/// Header Vault reads the client token from.
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Per-request timeout unless overridden.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("vault not reachable at {addr}")]
    ConnectionFailed { addr: String },

    #[error("vault returned {status}: {}", errors.join("; "))]
    Api { status: u16, errors: Vec<String> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid vault address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.origin().ascii_serialization())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else if e.is_decode() {
            ClientError::InvalidResponse(e.to_string())
        } else {
            ClientError::Http(e.to_string())
        }
    }
}

/// Error body returned by Vault on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// Vault API client.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct Client {
    address: Url,
    token: Option<RootToken>,
    http: reqwest::Client,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address.as_str())
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create an unauthenticated client for `address` (e.g. `http://127.0.0.1:8200`).
    pub fn new(address: &str) -> Result<Self, ClientError> {
        Self::with_timeout(address, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client whose requests give up after `timeout`.
    pub fn with_timeout(address: &str, timeout: Duration) -> Result<Self, ClientError> {
        let address = Url::parse(address.trim_end_matches('/')).map_err(|e| {
            ClientError::InvalidAddress {
                addr: address.to_string(),
                reason: e.to_string(),
            }
        })?;
        if address.cannot_be_a_base() {
            return Err(ClientError::InvalidAddress {
                addr: address.to_string(),
                reason: "not a base URL".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(Self {
            address,
            token: None,
            http,
        })
    }

    /// Create a client from a produced [`VaultConfig`], authenticated with its token.
    pub fn from_config(config: &VaultConfig, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self::with_timeout(&config.address, timeout)?.with_token(config.token.clone()))
    }

    pub fn with_token(mut self, token: RootToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Replace the token used for subsequent requests.
    pub fn set_token(&mut self, token: RootToken) {
        self.token = Some(token);
    }

    pub fn token(&self) -> Option<&RootToken> {
        self.token.as_ref()
    }

    /// Base address, without a trailing slash.
    pub fn address(&self) -> &str {
        self.address.as_str().trim_end_matches('/')
    }

    /// `sys/*` endpoints.
    pub fn sys(&self) -> Sys<'_> {
        Sys::new(self)
    }

    /// `auth/token/*` endpoints.
    pub fn auth_token(&self) -> AuthToken<'_> {
        AuthToken::new(self)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            if let Ok(mut value) = HeaderValue::from_str(token.expose()) {
                value.set_sensitive(true);
                headers.insert(TOKEN_HEADER, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.address(), path.trim_start_matches('/'))
    }

    /// Issue a request and return the raw response, whatever its status.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .request(method, self.url(path))
            .headers(self.headers())
            .send()
            .await?;
        Ok(response)
    }

    /// GET `path` and decode a JSON body from a 2xx response.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.send(Method::GET, path).await?;
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Self::decode(response).await
    }

    pub(crate) async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Turn a non-2xx response into a [`ClientError::Api`].
    pub(crate) async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let errors = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.errors)
            .unwrap_or_default();
        let errors = if errors.is_empty() {
            vec![status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()]
        } else {
            errors
        };
        ClientError::Api {
            status: status.as_u16(),
            errors,
        }
    }

    pub(crate) fn is_status(response: &reqwest::Response, codes: &[u16]) -> bool {
        let status: StatusCode = response.status();
        codes.contains(&status.as_u16())
    }
}
