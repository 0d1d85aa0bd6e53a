//! Core types shared by the fixture and its consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root token handed to a dev-mode Vault server via `-dev-root-token-id`.
///
/// `Debug` and `Display` are redacted so the value never ends up in logs;
/// use [`RootToken::expose`] where the raw token is genuinely needed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootToken(String);

impl RootToken {
    /// Generate a fresh random token (UUIDv4, same shape Vault uses).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RootToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootToken(<redacted>)")
    }
}

impl std::fmt::Display for RootToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Vault integration settings produced by a running fixture.
///
/// This is the value handed to whatever component under test needs to talk
/// to Vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub token: RootToken,
    pub address: String,
}

impl VaultConfig {
    /// Config for a dev server at `address`, enabled and authenticated with `token`.
    pub fn enabled(address: impl Into<String>, token: RootToken) -> Self {
        Self {
            enabled: Some(true),
            token,
            address: address.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}
