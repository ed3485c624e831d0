//! Retry/backoff coordination for client operations.
//!
//! [`RetryCoordinator::run`] wraps one logical operation ("upload
//! db.tar.gz", "resume db.tar.gz") in:
//!
//! 1. an optional pre-flight connectivity probe, followed by a bounded
//!    wait-for-connectivity loop when the probe fails,
//! 2. repeated attempts with exponential backoff
//!    (`delay = base * 2^(attempt-1)`, capped at `max_delay`),
//! 3. an optional whole-operation timeout.
//!
//! Only errors for which [`Error::is_retryable`] holds are retried. A probe
//! that never succeeds surfaces as `Timeout { layer: Probe }` ("never got to
//! try"), distinct from `RetryExhausted` ("tried repeatedly and failed").
//! Cancellation interrupts probing, attempts and backoff sleeps immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, TimeoutLayer};

/// Retry behaviour, loaded from the `[retry]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Whether to probe connectivity before the first attempt
    pub probe: bool,
    /// Timeout of a single probe connect
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// How long to wait for connectivity when the first probe fails
    #[serde(with = "humantime_serde")]
    pub connectivity_wait: Duration,
    /// Pause between probes while waiting
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            probe: true,
            probe_timeout: Duration::from_secs(5),
            connectivity_wait: Duration::from_secs(120),
            probe_interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after a failed attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for zero attempts or a zero probe timeout.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                key: "retry.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.probe && self.probe_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                key: "retry.probe_timeout".to_string(),
                reason: "must be greater than zero when probing is enabled".to_string(),
            });
        }
        Ok(())
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    probe_target: Option<String>,
    operation_timeout: Option<Duration>,
}

impl RetryCoordinator {
    /// Create a coordinator without probing or an overall timeout.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            probe_target: None,
            operation_timeout: None,
        }
    }

    /// Probe `target` (`host:port`) before the first attempt, if the policy
    /// enables probing.
    #[must_use]
    pub fn with_probe_target(mut self, target: impl Into<String>) -> Self {
        self.probe_target = Some(target.into());
        self
    }

    /// Bound the whole operation, probing and backoff included.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// The policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// - `Error::Cancelled` if `cancel` fires
    /// - `Error::Timeout` with `TimeoutLayer::Probe` if the target never became
    ///   reachable, or `TimeoutLayer::Operation` if the overall timeout expired
    /// - `Error::RetryExhausted` after `max_attempts` retryable failures
    /// - any non-retryable error from an attempt, unchanged
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let body = self.run_inner(operation, cancel, attempt, started);

        match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, body).await.map_err(|_| {
                tracing::warn!(operation, timeout = ?limit, "Operation timed out");
                Error::timeout(operation, TimeoutLayer::Operation, started.elapsed())
            })?,
            None => body.await,
        }
    }

    async fn run_inner<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut attempt: F,
        started: Instant,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.policy.probe {
            if let Some(target) = &self.probe_target {
                wait_for_connectivity(operation, target, &self.policy, cancel).await?;
            }
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut number = 1;

        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                result = attempt(number) => result,
            };

            let error = match result {
                Ok(value) => {
                    if number > 1 {
                        tracing::info!(operation, attempts = number, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                tracing::debug!(operation, attempt = number, error = %error, "Non-retryable failure");
                return Err(error);
            }

            if number >= max_attempts {
                tracing::warn!(
                    operation,
                    attempts = number,
                    elapsed = ?started.elapsed(),
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(Error::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: number,
                    elapsed: started.elapsed(),
                    last_error: Box::new(error),
                });
            }

            let delay = self.policy.delay_for_attempt(number);
            tracing::warn!(
                operation,
                attempt = number,
                max_attempts,
                delay = ?delay,
                error = %error,
                "Attempt failed, backing off"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            number += 1;
        }
    }
}

/// Try one TCP connect to `target` within `timeout`.
pub async fn probe_connectivity(target: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(target_addr = target, error = %e, "Connectivity probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(target_addr = target, "Connectivity probe timed out");
            false
        }
    }
}

/// Probe `target`, then keep probing until it answers or the wait runs out.
///
/// # Errors
///
/// Returns `Error::Cancelled` if cancelled, or `Error::Timeout` with
/// `TimeoutLayer::Probe` once `connectivity_wait` has elapsed.
pub async fn wait_for_connectivity(
    operation: &str,
    target: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + policy.connectivity_wait;

    loop {
        let reachable = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            ok = probe_connectivity(target, policy.probe_timeout) => ok,
        };
        if reachable {
            if started.elapsed() > policy.probe_timeout {
                tracing::info!(target_addr = target, waited = ?started.elapsed(), "Connectivity restored");
            }
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(operation, TimeoutLayer::Probe, started.elapsed()));
        }

        let pause = policy.probe_interval.min(deadline - now);
        tracing::info!(target_addr = target, retry_in = ?pause, "Waiting for connectivity");

        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(pause) => {}
        }
    }
}
