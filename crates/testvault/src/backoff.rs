//! Randomized delay between launch attempts.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::time::Duration;

/// Uniform random delay in `[0, max)`, drawn from an injected RNG.
///
/// Parallel test runs that collide on a port tend to retry in lockstep;
/// jitter spreads them out.
pub struct Backoff {
    max: Duration,
    rng: Box<dyn RngCore + Send>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl Backoff {
    pub fn new(max: Duration, rng: Box<dyn RngCore + Send>) -> Self {
        Self { max, rng }
    }

    /// Backoff seeded from OS entropy.
    pub fn from_entropy(max: Duration) -> Self {
        Self::new(max, Box::new(StdRng::from_entropy()))
    }

    /// Draw the next delay. Always zero when `max` is zero.
    pub fn next_delay(&mut self) -> Duration {
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..max_ms))
    }

    /// Sleep for the next delay and return how long that was.
    pub async fn sleep(&mut self) -> Duration {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}
