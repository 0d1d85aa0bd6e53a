//! Bounded polling until a condition holds.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;
use vault_api::{Client, ClientError};
use vault_core::FixtureConfig;

#[derive(Debug, Error)]
pub enum PollError<E> {
    /// Every attempt failed; `last` is the most recent reason.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> PollError<E> {
    /// The error from the final attempt.
    pub fn last(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Delay between attempts.
    pub interval: Duration,
    /// Maximum attempts; at least one attempt is always made.
    pub retries: u32,
    /// Wall-clock bound checked between attempts.
    pub deadline: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            retries: 500,
            deadline: None,
        }
    }
}

impl PollOptions {
    /// Readiness polling derived from fixture settings.
    ///
    /// The deadline is the nominal polling time plus one request timeout, so
    /// a single slow request near the end can still complete.
    pub fn from_config(config: &FixtureConfig) -> Self {
        let retries = config.poll_retries_scaled();
        let deadline = config
            .poll_interval()
            .saturating_mul(retries)
            .saturating_add(config.request_timeout());
        Self {
            interval: config.poll_interval(),
            retries,
            deadline: Some(deadline),
        }
    }
}

/// Run `check` until it returns `Ok`, up to `opts.retries` attempts.
///
/// Returns the number of attempts it took. On exhaustion, the error from the
/// most recent attempt is returned.
pub async fn wait_for_result<F, Fut, E>(opts: PollOptions, mut check: F) -> Result<u32, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let max_attempts = opts.retries.max(1);
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let last = match check().await {
            Ok(()) => return Ok(attempt),
            Err(e) => e,
        };

        let past_deadline = opts
            .deadline
            .is_some_and(|deadline| started.elapsed() >= deadline);
        if attempt >= max_attempts || past_deadline {
            return Err(PollError::Exhausted {
                attempts: attempt,
                last,
            });
        }

        trace!(attempt, error = %last, "condition not met yet");
        tokio::time::sleep(opts.interval).await;
    }
}

/// Why a readiness check did not pass.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("vault is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Poll `sys/init` until Vault reports itself initialized.
pub async fn wait_for_api(
    client: &Client,
    opts: PollOptions,
) -> Result<u32, PollError<ReadinessError>> {
    wait_for_result(opts, || async move {
        match client.sys().init_status().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReadinessError::NotInitialized),
            Err(e) => Err(e.into()),
        }
    })
    .await
}
