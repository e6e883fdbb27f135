// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry engine with capped exponential backoff for device operations.
//
// Errors are classified as Transient (retry) or Permanent (give up at once).
// Bad credentials and rejected commands never improve on a second attempt,
// so only transient failures consume the retry budget.

use std::future::Future;
use std::time::Duration;

use printforge_core::config::AgentConfig;
use printforge_core::error::{PrintforgeError, Result};
use printforge_core::types::ErrorClass;
use tracing::{debug, info, warn};

/// Backoff policy for a single device operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(32),
            multiplier: 2,
        }
    }
}

/// Result of evaluating whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after this delay.
    RetryAfter(Duration),
    /// Do not retry; the error will not go away by itself.
    GiveUp(ErrorClass),
    /// Attempt budget used up.
    Exhausted,
}

/// Classify a `PrintforgeError` for retry decisions.
pub fn classify_error(err: &PrintforgeError) -> ErrorClass {
    err.class()
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            ..Default::default()
        }
    }

    /// Upload policy derived from the agent settings.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.upload_attempts,
            config.retry_base_delay(),
            config.retry_max_delay(),
        )
    }

    /// Delay before retry number `retry` (0 for the first retry).
    ///
    /// delay = min(base * multiplier^retry, max_delay)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Decide what to do after `attempts` attempts have failed with `err`.
    pub fn decide(&self, err: &PrintforgeError, attempts: u32) -> RetryDecision {
        match classify_error(err) {
            ErrorClass::Permanent => {
                info!(error = %err, "permanent error; not retrying");
                RetryDecision::GiveUp(ErrorClass::Permanent)
            }
            ErrorClass::Transient => {
                if attempts >= self.max_attempts {
                    warn!(attempts, max = self.max_attempts, "retry limit exhausted");
                    RetryDecision::Exhausted
                } else {
                    let delay = self.delay_for(attempts.saturating_sub(1));
                    debug!(attempts, delay_ms = delay.as_millis() as u64, "scheduling retry");
                    RetryDecision::RetryAfter(delay)
                }
            }
        }
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// The last error is returned unchanged so callers can still classify it.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(operation, attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match self.decide(&err, attempts) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        operation,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(_) | RetryDecision::Exhausted => return Err(err),
            }
        }
    }
}
