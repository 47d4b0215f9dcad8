//! Rate-limit-aware retry with exponential backoff and jitter.
//!
//! Failures are classified in order: rate-limited (429), transient (network,
//! 408/5xx gateway codes, timeouts), fatal. Fatal failures are returned after
//! one invocation; the others are retried up to `max_retries` times.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{FetchError, Result, ServiceError};

/// HTTP statuses retried with backoff.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [408, 500, 502, 503, 504];

/// Millisecond retry hints, checked before `retry-after`.
pub const RETRY_AFTER_MS_HEADERS: [&str; 2] = ["retry-after-ms", "x-ms-retry-after-ms"];

/// Seconds-based retry hint.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Fraction of the delay spread by jitter.
const JITTER_FACTOR: f64 = 0.2;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP 429; honor retry hints.
    RateLimited,
    /// Network or gateway failure; back off and retry.
    Transient,
    /// Do not retry.
    Fatal,
}

/// Classifies a failure for retry purposes.
#[must_use]
pub fn classify(err: &FetchError) -> FailureClass {
    match err {
        FetchError::RateLimited(_) => FailureClass::RateLimited,
        FetchError::TransientNetwork(_) => FailureClass::Transient,
        FetchError::QueryExecution(e) => classify_service_error(e),
        _ => FailureClass::Fatal,
    }
}

fn classify_service_error(err: &ServiceError) -> FailureClass {
    if err.status == Some(429) || err.code.as_deref() == Some("TooManyRequests") {
        return FailureClass::RateLimited;
    }
    if err.network.is_some()
        || err.status.is_some_and(|s| RETRYABLE_STATUS_CODES.contains(&s))
        || err.mentions_timeout()
    {
        return FailureClass::Transient;
    }
    FailureClass::Fatal
}

/// Reads the server's retry hint, preferring millisecond headers.
#[must_use]
pub fn retry_after(err: &ServiceError) -> Option<Duration> {
    for name in RETRY_AFTER_MS_HEADERS {
        if let Some(ms) = err.header(name).and_then(|v| v.trim().parse::<f64>().ok()) {
            if ms.is_finite() && ms >= 0.0 {
                return Some(Duration::from_millis(ms as u64));
            }
        }
    }
    err.header(RETRY_AFTER_HEADER)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs.min(f64::from(u32::MAX))))
}

/// Callback invoked when consecutive rate limits reach the alert threshold.
pub type RateLimitAlert = Arc<dyn Fn(u32) + Send + Sync>;

/// Retries an async operation according to a [`RetryConfig`].
pub struct RetryExecutor {
    config: RetryConfig,
    consecutive_rate_limits: AtomicU32,
    on_rate_limit_alert: Option<RateLimitAlert>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("consecutive_rate_limits", &self.consecutive_rate_limits())
            .field("has_alert_hook", &self.on_rate_limit_alert.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// Creates an executor, validating the configuration.
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            consecutive_rate_limits: AtomicU32::new(0),
            on_rate_limit_alert: None,
        })
    }

    /// Installs a callback for sustained rate limiting.
    #[must_use]
    pub fn with_rate_limit_alert(mut self, hook: RateLimitAlert) -> Self {
        self.on_rate_limit_alert = Some(hook);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns how many rate-limited failures have occurred since the last success.
    #[must_use]
    pub fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits.load(Ordering::Relaxed)
    }

    /// Exponential backoff for a zero-based retry attempt, without jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_multiplier.powi(attempt as i32);
        let millis = (self.config.initial_delay_ms as f64 * factor)
            .min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Backoff with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt).as_millis() as f64;
        let r: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let jittered = base + base * JITTER_FACTOR * (r - 0.5);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Runs `operation`, retrying rate-limited and transient failures.
    ///
    /// Returns `RetryExhausted` wrapping the last failure when every retry
    /// fails, or the failure itself when it is not retryable.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    self.consecutive_rate_limits.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classify(&err);
            if class == FailureClass::Fatal {
                debug!(attempt, error = %err, "non-retryable failure");
                return Err(err);
            }

            if class == FailureClass::RateLimited {
                self.record_rate_limit();
            }

            if attempt >= self.config.max_retries {
                warn!(attempts = attempt + 1, error = %err, "retries exhausted");
                return Err(FetchError::RetryExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }

            let delay = match class {
                FailureClass::RateLimited => err
                    .service_error()
                    .and_then(retry_after)
                    .unwrap_or_else(|| self.jittered_delay(attempt)),
                _ => self.jittered_delay(attempt),
            };

            warn!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                class = ?class,
                error = %err,
                "retrying after failure"
            );

            sleep(delay).await;
            attempt += 1;
        }
    }

    fn record_rate_limit(&self) {
        let count = self.consecutive_rate_limits.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.config.rate_limit_alert_threshold {
            warn!(
                consecutive_rate_limits = count,
                "log service is rate limiting repeatedly"
            );
            if let Some(ref hook) = self.on_rate_limit_alert {
                hook(count);
            }
        }
    }
}
