//! Golden-ratio retry policy for venue calls.
//!
//! Attempt `n` (0-based) that fails transiently waits `max(1, φⁿ)` base
//! delays before the next one. With the default one-second base and five
//! retries the waits are 1, 1.62, 2.62, 4.24 and 6.85 seconds.

use crate::domain::errors::ExchangeError;
use crate::domain::services::ratchet::PHI;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn golden(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Wait after failed attempt `n`
    pub fn delay_for(&self, n: u32) -> Duration {
        self.base_delay.mul_f64(PHI.powi(n as i32).max(1.0))
    }

    /// Sum of every wait the policy can impose
    pub fn total_budget(&self) -> Duration {
        (0..self.max_retries).map(|n| self.delay_for(n)).sum()
    }
}

/// Run `op` until it succeeds, fails permanently or the retries run out.
///
/// Only errors with [`ExchangeError::is_retryable`] are repeated; anything
/// else returns immediately. An exhausted transport failure is returned with
/// the total attempt count.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    retry_when(policy, label, ExchangeError::is_retryable, op).await
}

/// Like [`retry_with_backoff`], with the caller deciding which errors may
/// be repeated
pub async fn retry_when<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
    P: Fn(&ExchangeError) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:.2}s",
                    label,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay.as_secs_f64()
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(ExchangeError::Transport { message, .. }) => {
                error!(
                    "{} failed after {} attempt(s): {}",
                    label,
                    attempt + 1,
                    message
                );
                return Err(ExchangeError::transport(attempt + 1, message));
            }
            Err(e) => return Err(e),
        }
    }
}
