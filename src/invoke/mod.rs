pub mod http;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::engine::runlog::RunLog;

/// Rate-limit reasons some APIs attach to 403 responses instead of 429.
const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

/// Classified failure of a single external call.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        reason: Option<String>,
        message: String,
    },
    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl ApiError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Retryable: 429, 500/502/503/504, 403 carrying a rate-limit reason,
    /// and any transport-level failure. Everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Http { status, reason, .. } => match status {
                429 | 500 | 502 | 503 | 504 => true,
                403 => reason
                    .as_deref()
                    .is_some_and(|r| RATE_LIMIT_REASONS.contains(&r)),
                _ => false,
            },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Transport { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ApiError::Http { reason, .. } => reason.as_deref(),
            ApiError::Transport { .. } => None,
        }
    }
}

/// Error escaping the invoker: either the original fatal failure or a
/// structured exhaustion of the retry budget.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("{operation}: fatal API error: {error}")]
    Fatal {
        operation: String,
        #[source]
        error: ApiError,
    },
    #[error("{operation}: retry budget exhausted after {attempts} attempts: {message}")]
    Exhausted {
        operation: String,
        attempts: u32,
        status: Option<u16>,
        reason: Option<String>,
        message: String,
    },
}

impl InvokeError {
    pub fn operation(&self) -> &str {
        match self {
            InvokeError::Fatal { operation, .. } => operation,
            InvokeError::Exhausted { operation, .. } => operation,
        }
    }

    /// Fatal failures fail fast and never consume retry budget.
    pub fn attempts(&self) -> u32 {
        match self {
            InvokeError::Fatal { .. } => 1,
            InvokeError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            InvokeError::Fatal { error, .. } => error.status(),
            InvokeError::Exhausted { status, .. } => *status,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            InvokeError::Fatal { error, .. } => error.reason(),
            InvokeError::Exhausted { reason, .. } => reason.as_deref(),
        }
    }

    /// Stable machine-readable code recorded in error artifacts.
    pub fn code(&self) -> &'static str {
        match self {
            InvokeError::Fatal { .. } => "api_fatal",
            InvokeError::Exhausted { .. } => "api_retry_exhausted",
        }
    }
}

/// Retry configuration for one invoker instance. There is no "infinite"
/// encoding: `max_attempts` is clamped to at least 1.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_ratio: f64,
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            jitter_ratio: 0.2,
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Jittered exponential delay before retrying attempt `attempt` (1-based):
/// `min(max_backoff, initial * 2^(attempt-1))` scaled by a uniform factor
/// in `[1 - jitter_ratio, 1 + jitter_ratio]`.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exp = policy.initial_backoff.as_secs_f64() * 2.0_f64.powi(attempt.saturating_sub(1) as i32);
    let capped = exp.min(policy.max_backoff.as_secs_f64());

    let jitter = if policy.jitter_ratio > 0.0 {
        1.0 + rand::thread_rng().gen_range(-policy.jitter_ratio..=policy.jitter_ratio)
    } else {
        1.0
    };

    Duration::from_secs_f64((capped * jitter).max(0.0))
}

/// Wraps one external call with classification, backoff, and a bounded
/// retry budget. Carries no mutable state across invocations, so
/// independent concurrent calls need no locking.
#[derive(Debug, Clone, Default)]
pub struct Invoker {
    policy: RetryPolicy,
    log: Option<RunLog>,
}

impl Invoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, log: None }
    }

    /// Attach a run log so retry attempts show up in the run's audit
    /// stream as `api_retry` records.
    pub fn with_run_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `call` until it succeeds, fails fatally, or the retry
    /// budget is exhausted. `operation` names the call in diagnostics.
    pub async fn invoke<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, InvokeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            let outcome = match self.policy.call_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, call()).await {
                    Ok(r) => r,
                    Err(_) => Err(ApiError::Transport {
                        message: format!("call timed out after {:.1}s", timeout.as_secs_f64()),
                    }),
                },
                None => call().await,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(InvokeError::Fatal {
                    operation: operation.to_string(),
                    error: err,
                });
            }

            if attempt >= max_attempts {
                return Err(InvokeError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    status: err.status(),
                    reason: err.reason().map(str::to_string),
                    message: err.to_string(),
                });
            }

            let delay = backoff_delay(attempt, &self.policy);
            warn!(
                operation,
                attempt,
                max_attempts,
                status = ?err.status(),
                sleep_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            if let Some(log) = &self.log {
                // best effort; a failed audit line must not abort the call
                let _ = log
                    .info(
                        "api_retry",
                        json!({
                            "operation": operation,
                            "attempt": attempt,
                            "max_attempts": max_attempts,
                            "status_code": err.status(),
                            "sleep_ms": delay.as_millis() as u64,
                        }),
                    )
                    .await;
            }

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
