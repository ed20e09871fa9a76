use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::warn;

use crate::error::ApiError;
use crate::util::parse_retry_after;

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(300);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_JITTER_RATIO: f64 = 0.2;
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Decides whether a failed attempt is worth repeating.
///
/// `attempt` is the 1-based number of the attempt that just failed. Any
/// `Fn(&ApiError, usize) -> bool` closure is a classifier.
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, error: &ApiError, attempt: usize) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&ApiError, usize) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &ApiError, attempt: usize) -> bool {
        self(error, attempt)
    }
}

/// Snapshot of a failed attempt that is about to be retried.
#[derive(Debug)]
pub struct AttemptRecord<'a> {
    pub attempt: usize,
    pub error: &'a ApiError,
    pub elapsed: Duration,
    pub retries_remaining: usize,
    pub next_delay: Duration,
}

pub trait AttemptObserver: Send + Sync {
    fn on_attempt_failed(&self, record: &AttemptRecord<'_>);
}

impl<F> AttemptObserver for F
where
    F: Fn(&AttemptRecord<'_>) + Send + Sync,
{
    fn on_attempt_failed(&self, record: &AttemptRecord<'_>) {
        self(record)
    }
}

/// Network failures, 5xx and 429 are transient; every other outcome is a
/// problem with the request itself.
pub fn is_retryable_by_default(error: &ApiError) -> bool {
    match error {
        ApiError::Network { .. } => true,
        ApiError::Http { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    jitter: bool,
    jitter_ratio: f64,
    respect_retry_after: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
    attempt_observer: Option<Arc<dyn AttemptObserver>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("respect_retry_after", &self.respect_retry_after)
            .field("custom_classifier", &self.retry_classifier.is_some())
            .field("attempt_observer", &self.attempt_observer.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            respect_retry_after: true,
            retry_classifier: None,
            attempt_observer: None,
        }
    }

    pub fn disabled() -> Self {
        Self::standard().max_retries(0)
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay.max(MIN_DELAY);
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = if backoff_multiplier.is_finite() {
            backoff_multiplier.max(1.0)
        } else {
            DEFAULT_BACKOFF_MULTIPLIER
        };
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            DEFAULT_JITTER_RATIO
        };
        self
    }

    pub fn respect_retry_after(mut self, respect_retry_after: bool) -> Self {
        self.respect_retry_after = respect_retry_after;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn retry_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&ApiError, usize) -> bool + Send + Sync + 'static,
    {
        self.retry_classifier(Arc::new(predicate))
    }

    pub fn attempt_observer(mut self, attempt_observer: Arc<dyn AttemptObserver>) -> Self {
        self.attempt_observer = Some(attempt_observer);
        self
    }

    pub fn on_attempt_failed<F>(self, callback: F) -> Self
    where
        F: Fn(&AttemptRecord<'_>) + Send + Sync + 'static,
    {
        self.attempt_observer(Arc::new(callback))
    }

    pub fn max_retries_value(&self) -> usize {
        self.max_retries
    }

    pub fn base_delay_value(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay_value(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier_value(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn jitter_value(&self) -> bool {
        self.jitter
    }

    pub fn jitter_ratio_value(&self) -> f64 {
        self.jitter_ratio
    }

    pub fn respect_retry_after_value(&self) -> bool {
        self.respect_retry_after
    }

    /// Whether the failed attempt `attempt` (1-based) should be followed by
    /// another one.
    pub fn should_retry(&self, error: &ApiError, attempt: usize) -> bool {
        if attempt > self.max_retries {
            return false;
        }
        match &self.retry_classifier {
            Some(retry_classifier) => retry_classifier.should_retry(error, attempt),
            None => is_retryable_by_default(error),
        }
    }

    /// Wait before attempt `attempt + 1`: `base * multiplier^(attempt - 1)`,
    /// capped at the max delay, then jittered.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.apply_jitter(self.backoff_for_attempt(attempt))
    }

    pub(crate) fn retry_delay(&self, error: &ApiError, attempt: usize) -> Duration {
        if self.respect_retry_after
            && let ApiError::Http { headers, .. } = error
            && let Some(retry_after) = parse_retry_after(headers, SystemTime::now())
        {
            return retry_after.min(self.max_delay);
        }
        self.delay_for_attempt(attempt)
    }

    pub(crate) fn notify_attempt_failed(&self, record: &AttemptRecord<'_>) {
        let Some(attempt_observer) = &self.attempt_observer else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            attempt_observer.on_attempt_failed(record)
        }));
        if outcome.is_err() {
            warn!(attempt = record.attempt, "attempt observer panicked; ignoring");
        }
    }

    fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let base_nanos = self.base_delay.as_nanos() as f64;
        let max_nanos = self.max_delay.as_nanos() as f64;
        let scaled = base_nanos * self.backoff_multiplier.powi(exponent);
        let nanos = if scaled.is_finite() {
            scaled.min(max_nanos)
        } else {
            max_nanos
        };
        Duration::from_nanos(nanos.round() as u64)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || self.jitter_ratio <= f64::EPSILON {
            return delay;
        }

        let delay_nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
        let jitter_span = ((delay_nanos as f64) * self.jitter_ratio).round() as u64;
        if jitter_span == 0 {
            return delay;
        }
        let max_nanos = self.max_delay.as_nanos().min(u64::MAX as u128) as u64;
        let low = delay_nanos.saturating_sub(jitter_span);
        let high = delay_nanos.saturating_add(jitter_span);
        let sampled = rand::rng().random_range(low..=high).min(max_nanos.max(1));
        Duration::from_nanos(sampled)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
