//! Generic exponential-backoff retry with a retryability predicate and a
//! per-attempt callback.
//!
//! The callback exists so outer layers can self-correct between attempts
//! (the proxy server-name pinning relies on it).

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.powi(attempt.min(30) as i32);
        let millis = (self.initial.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max)
    }
}

/// Proxy-link open: infinite retry, 5 s -> 30 s, x1.5.
pub const PROXY_OPEN_BACKOFF: Backoff =
    Backoff::new(Duration::from_secs(5), Duration::from_secs(30), 1.5);

/// Device discovery: 10 s -> 120 s.
pub const DISCOVERY_BACKOFF: Backoff =
    Backoff::new(Duration::from_secs(10), Duration::from_secs(120), 2.0);

/// Per-bed setup: 5 s -> 30 s.
pub const SETUP_BACKOFF: Backoff =
    Backoff::new(Duration::from_secs(5), Duration::from_secs(30), 2.0);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// None means retry forever (the supervisor's proxy loop).
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn forever(backoff: Backoff) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub const fn limited(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
        }
    }
}

/// Runs `op` until it succeeds, the predicate rejects the error, or the
/// attempt limit runs out. `on_retry` fires before each backoff sleep.
pub async fn retry<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut is_retryable: impl FnMut(&anyhow::Error) -> bool,
    mut on_retry: impl FnMut(u32, &anyhow::Error),
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(label, attempt, "operation recovered after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                if let Some(max) = policy.max_attempts {
                    if attempt + 1 >= max {
                        return Err(err.context(format!("{label}: retries exhausted")));
                    }
                }
                let delay = policy.backoff.delay(attempt);
                warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %format!("{err:#}"), "retrying");
                on_retry(attempt, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
