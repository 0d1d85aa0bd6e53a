//! Fixture configuration.
//!
//! Uses the same key=value format as the other tooling config files:
//! one `key=value` per line, `#` comments, optional quotes around values.
//! Precedence: `TESTVAULT_*` environment variables > config file > defaults.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides (e.g. `TESTVAULT_MAX_ATTEMPTS=3`).
pub const ENV_PREFIX: &str = "TESTVAULT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("environment variable {0} is not valid UTF-8")]
    NonUnicodeEnv(String),
}

/// Launch, readiness and teardown settings for a test Vault server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Vault binary to execute (looked up on `PATH` when relative).
    pub binary: PathBuf,
    /// Launch attempts before construction gives up.
    pub max_attempts: u32,
    /// How long a freshly started process must survive before readiness polling.
    pub start_timeout_ms: u64,
    /// Scales start timeout and poll retries on slow machines.
    pub timeout_multiplier: u32,
    /// Upper bound (exclusive) of the random sleep between attempts.
    pub retry_jitter_ms: u64,
    /// How long `stop` waits for the process to confirm exit after a kill.
    pub stop_timeout_ms: u64,
    /// Delay between readiness polls.
    pub poll_interval_ms: u64,
    /// Readiness polls per attempt, before scaling by `timeout_multiplier`.
    pub poll_retries: u32,
    /// Per-request timeout of the API client.
    pub request_timeout_ms: u64,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("vault"),
            max_attempts: 11,
            start_timeout_ms: 500,
            timeout_multiplier: default_multiplier(),
            retry_jitter_ms: 2000,
            stop_timeout_ms: 1000,
            poll_interval_ms: 10,
            poll_retries: 500,
            request_timeout_ms: 5000,
        }
    }
}

/// CI machines are slower and noisier; give them more headroom.
fn default_multiplier() -> u32 {
    if std::env::var_os("CI").is_some() {
        3
    } else {
        1
    }
}

impl FixtureConfig {
    /// Defaults overlaid with `TESTVAULT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_os(std::env::vars_os())
    }

    /// Apply `TESTVAULT_<KEY>` overrides from raw OS strings.
    ///
    /// Variables outside the prefix are skipped whatever their encoding; a
    /// prefixed variable with a non-UTF-8 value is an error.
    pub fn apply_env_os<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut prefixed = Vec::new();
        for (name, value) in vars {
            let Some(name) = name.to_str().filter(|n| n.starts_with(ENV_PREFIX)) else {
                continue;
            };
            let value = value
                .into_string()
                .map_err(|_| ConfigError::NonUnicodeEnv(name.to_string()))?;
            prefixed.push((name.to_string(), value));
        }
        self.apply_env_vars(prefixed)
    }

    /// Apply `TESTVAULT_<KEY>` overrides from an arbitrary variable set.
    ///
    /// Unrelated variables are ignored; unknown `TESTVAULT_` keys are errors.
    pub fn apply_env_vars<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut ci = false;
        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            ci |= self.apply_value(&key.to_ascii_lowercase(), value.as_ref())?;
        }
        self.apply_ci(ci);
        Ok(())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        let mut ci = false;
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let value = Self::unquote(value.trim());
            ci |= self.apply_value(key.trim(), &value)?;
        }
        self.apply_ci(ci);
        Ok(())
    }

    /// The CI flag only ever raises the multiplier, after explicit values are in.
    fn apply_ci(&mut self, ci: bool) {
        if ci {
            self.timeout_multiplier = self.timeout_multiplier.max(3);
        }
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Set one key. Returns the `ci` flag, which the caller applies last.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key {
            "binary" => self.binary = PathBuf::from(value),
            "max_attempts" => {
                self.max_attempts = Self::parse_int(key, value)?;
                if self.max_attempts == 0 {
                    return Err(ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            "start_timeout_ms" => self.start_timeout_ms = Self::parse_int(key, value)?,
            "timeout_multiplier" => {
                self.timeout_multiplier = Self::parse_int(key, value)?;
                if self.timeout_multiplier == 0 {
                    return Err(ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            "retry_jitter_ms" => self.retry_jitter_ms = Self::parse_int(key, value)?,
            "stop_timeout_ms" => self.stop_timeout_ms = Self::parse_int(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = Self::parse_int(key, value)?,
            "poll_retries" => self.poll_retries = Self::parse_int(key, value)?,
            "request_timeout_ms" => self.request_timeout_ms = Self::parse_int(key, value)?,
            // `TESTVAULT_CI=true` forces the CI multiplier without the global `CI` var.
            "ci" => return Self::parse_bool(key, value),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(false)
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Time a new process must stay alive before it counts as started.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms.saturating_mul(u64::from(self.timeout_multiplier)))
    }

    /// Readiness polls per attempt, scaled by the multiplier.
    pub fn poll_retries_scaled(&self) -> u32 {
        self.poll_retries.saturating_mul(self.timeout_multiplier)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
