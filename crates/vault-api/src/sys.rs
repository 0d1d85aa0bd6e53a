//! `sys/*` and `auth/token/*` endpoint wrappers.

use reqwest::Method;
use serde::Deserialize;

use crate::client::{Client, ClientError};

/// Status codes `sys/health` uses to report sealed, standby, or
/// uninitialized servers. Their bodies are still valid health responses.
const HEALTH_STATUS_CODES: &[u16] = &[200, 429, 472, 473, 501, 503];

#[derive(Debug, Deserialize)]
struct InitStatusResponse {
    initialized: bool,
}

/// Response from `GET /v1/sys/health`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthResponse {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

/// Subset of `GET /v1/auth/token/lookup-self` data.
///
/// The token id is deliberately not deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Deserialize)]
struct Secret<T> {
    data: T,
}

/// Handle for `sys/*` endpoints, borrowed from a [`Client`].
#[derive(Debug)]
pub struct Sys<'a> {
    client: &'a Client,
}

impl<'a> Sys<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Whether the server has been initialized.
    /// GET /v1/sys/init
    pub async fn init_status(&self) -> Result<bool, ClientError> {
        let body: InitStatusResponse = self.client.get_json("/v1/sys/init").await?;
        Ok(body.initialized)
    }

    /// Server health, including sealed and standby state.
    /// GET /v1/sys/health
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let response = self.client.send(Method::GET, "/v1/sys/health").await?;
        if !Client::is_status(&response, HEALTH_STATUS_CODES) {
            return Err(Client::handle_error(response).await);
        }
        Client::decode(response).await
    }
}

/// Handle for `auth/token/*` endpoints.
#[derive(Debug)]
pub struct AuthToken<'a> {
    client: &'a Client,
}

impl<'a> AuthToken<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Look up the client's own token. Fails with a 403 when unauthenticated.
    /// GET /v1/auth/token/lookup-self
    pub async fn lookup_self(&self) -> Result<TokenInfo, ClientError> {
        let secret: Secret<TokenInfo> = self.client.get_json("/v1/auth/token/lookup-self").await?;
        Ok(secret.data)
    }
}
