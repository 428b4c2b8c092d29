//! Bounded exponential backoff with jitter.
//!
//! The delay before retry `n` (1-based) is
//! `min(base_delay_ms * backoff_factor^(n-1), max_delay_ms)` plus a jitter
//! sample in `[0, jitter_ceiling)`. The base schedule is a pure function of
//! the policy; jitter comes from an injectable [`Jitter`] source.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::cancel::or_cancelled;
use crate::runtime::Sleeper;
use crate::{RequestError, Result};

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&RequestError) -> bool + Send + Sync>;

/// Retry behavior for one logical request.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier applied per retry; must be greater than 1.
    pub backoff_factor: f64,
    retry_predicate: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_factor", &self.backoff_factor)
            .field("retry_predicate", &"<predicate>")
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            retry_predicate: Arc::new(RequestError::is_default_retryable),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Replaces the retry predicate.
    ///
    /// Aborted and invalid requests stay terminal whatever the predicate says.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    pub fn should_retry(&self, error: &RequestError) -> bool {
        error.is_retry_eligible() && (self.retry_predicate)(error)
    }

    /// Backoff before retry `retry` (1-based), without jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(RequestError::Validation(format!(
                "backoff_factor must be a finite number greater than 1, got {}",
                self.backoff_factor
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(RequestError::Validation(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Applies the fields set in `overrides` on top of this policy.
    pub fn merged(&self, overrides: &RetryOverride) -> Self {
        Self {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            base_delay_ms: overrides.base_delay_ms.unwrap_or(self.base_delay_ms),
            max_delay_ms: overrides.max_delay_ms.unwrap_or(self.max_delay_ms),
            backoff_factor: overrides.backoff_factor.unwrap_or(self.backoff_factor),
            retry_predicate: overrides
                .retry_predicate
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.retry_predicate)),
        }
    }
}

/// Partial retry policy supplied per call; unset fields keep the base policy.
#[derive(Clone, Default)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub retry_predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOverride")
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_factor", &self.backoff_factor)
            .field(
                "retry_predicate",
                &self.retry_predicate.as_ref().map(|_| "<predicate>"),
            )
            .finish()
    }
}

impl RetryOverride {
    pub fn max_retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::default()
        }
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = Some(base_delay_ms);
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = Some(backoff_factor);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }
}

/// Source of the random component added to each backoff.
pub trait Jitter: Send + Sync + 'static {
    /// Returns a duration in `[0, ceiling)`, or zero when `ceiling` is zero.
    fn sample(&self, ceiling: Duration) -> Duration;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self, ceiling: Duration) -> Duration {
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling_ms))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn sample(&self, _ceiling: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Computes the full delay (backoff plus jitter) before a retry.
#[derive(Clone)]
pub struct DelayCalculator {
    jitter_ceiling: Duration,
    jitter: Arc<dyn Jitter>,
}

impl fmt::Debug for DelayCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayCalculator")
            .field("jitter_ceiling", &self.jitter_ceiling)
            .finish()
    }
}

impl Default for DelayCalculator {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Arc::new(RandomJitter))
    }
}

impl DelayCalculator {
    pub fn new(jitter_ceiling: Duration, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            jitter_ceiling,
            jitter,
        }
    }

    pub fn jitter_ceiling(&self) -> Duration {
        self.jitter_ceiling
    }

    pub fn delay(&self, policy: &RetryPolicy, retry: u32) -> Duration {
        policy.backoff_delay(retry) + self.jitter.sample(self.jitter_ceiling)
    }
}

/// Collaborators the retry loop needs besides the attempt itself.
#[derive(Clone, Copy)]
pub struct RetryContext<'a> {
    pub delays: &'a DelayCalculator,
    pub sleeper: &'a dyn Sleeper,
    /// Cancelling this token aborts a pending backoff wait.
    pub cancel: &'a CancellationToken,
    /// Identifies the request in log lines.
    pub label: &'a str,
}

/// Runs `attempt_fn` until it succeeds, fails with a non-retryable error or
/// exhausts `policy.max_retries`.
///
/// `attempt_fn` receives the zero-based attempt index. `on_retry` is called
/// with the one-based retry index and the computed delay before each backoff
/// wait. The last error is returned unchanged.
pub async fn run_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    ctx: RetryContext<'_>,
    mut attempt_fn: F,
    mut on_retry: R,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, Duration),
{
    let mut attempt = 0u32;
    loop {
        let error = match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= policy.max_retries || !policy.should_retry(&error) {
            return Err(error);
        }

        attempt += 1;
        let delay = ctx.delays.delay(policy, attempt);

        #[cfg(feature = "tracing")]
        tracing::info!(
            request = ctx.label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying request"
        );

        on_retry(attempt, delay);
        or_cancelled(ctx.cancel, ctx.sleeper.sleep(delay)).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::future;
    use tokio_util::sync::CancellationToken;

    use super::{run_with_retry, DelayCalculator, Jitter, NoJitter, RetryContext};
    use crate::runtime::{BoxFuture, Sleeper};
    use crate::{RequestError, RetryOverride, RetryPolicy};

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            self.delays
                .lock()
                .expect("delay log mutex must not be poisoned")
                .push(duration);
            Box::pin(future::ready(()))
        }
    }

    struct MaxJitter;

    impl Jitter for MaxJitter {
        fn sample(&self, ceiling: Duration) -> Duration {
            ceiling.saturating_sub(Duration::from_millis(1))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_base_delay_ms(10)
            .with_max_delay_ms(100)
    }

    fn transport_error() -> RequestError {
        RequestError::transport("connection refused")
    }

    async fn run_failing(
        policy: &RetryPolicy,
        error: RequestError,
        sleeper: &RecordingSleeper,
        token: &CancellationToken,
    ) -> (Result<(), RequestError>, u32, u32) {
        let delays = DelayCalculator::new(Duration::ZERO, Arc::new(NoJitter));
        let mut calls = 0u32;
        let mut retries = 0u32;
        let result = run_with_retry(
            policy,
            RetryContext {
                delays: &delays,
                sleeper,
                cancel: token,
                label: "GET:/test:",
            },
            |_| {
                calls += 1;
                let error = error.clone();
                async move { Err::<(), _>(error) }
            },
            |_, _| retries += 1,
        )
        .await;
        (result, calls, retries)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(8_000));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(10_000));
        assert_eq!(policy.backoff_delay(500), Duration::from_millis(10_000));
    }

    #[test]
    fn delays_are_non_decreasing_and_bounded() {
        let policy = RetryPolicy::default();
        let calculator = DelayCalculator::new(Duration::from_millis(1_000), Arc::new(MaxJitter));
        let ceiling = Duration::from_millis(policy.max_delay_ms + 1_000);

        let mut previous = Duration::ZERO;
        for retry in 1..=12 {
            let delay = calculator.delay(&policy, retry);
            assert!(delay >= previous, "retry {retry} went backwards");
            assert!(delay <= ceiling, "retry {retry} exceeded ceiling");
            previous = delay;
        }
    }

    #[test]
    fn random_jitter_stays_below_ceiling() {
        let calculator = DelayCalculator::default();
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = calculator.delay(&policy, 1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay < Duration::from_millis(2_000));
        }
    }

    #[tokio::test]
    async fn retryable_failure_runs_initial_plus_max_retries() {
        let sleeper = RecordingSleeper::default();
        let token = CancellationToken::new();
        let (result, calls, retries) =
            run_failing(&fast_policy(3), transport_error(), &sleeper, &token).await;

        assert_eq!(result, Err(transport_error()));
        assert_eq!(calls, 4);
        assert_eq!(retries, 3);
        assert_eq!(
            *sleeper.delays.lock().expect("delay log mutex must not be poisoned"),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_fast() {
        let sleeper = RecordingSleeper::default();
        let token = CancellationToken::new();
        let not_found = RequestError::Http {
            status: 404,
            body: "missing".to_owned(),
        };
        let (result, calls, _) = run_failing(&fast_policy(5), not_found.clone(), &sleeper, &token).await;

        assert_eq!(result, Err(not_found));
        assert_eq!(calls, 1);
        assert!(sleeper.delays.lock().expect("delay log mutex must not be poisoned").is_empty());
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let sleeper = RecordingSleeper::default();
        let token = CancellationToken::new();
        let (_, calls, retries) =
            run_failing(&fast_policy(0), transport_error(), &sleeper, &token).await;
        assert_eq!(calls, 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn aborted_is_never_retried_even_with_permissive_predicate() {
        let sleeper = RecordingSleeper::default();
        let token = CancellationToken::new();
        let policy = fast_policy(3).with_predicate(|_| true);
        let (result, calls, _) = run_failing(&policy, RequestError::Aborted, &sleeper, &token).await;
        assert_eq!(result, Err(RequestError::Aborted));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_wait() {
        let sleeper = RecordingSleeper::default();
        let token = CancellationToken::new();
        let delays = DelayCalculator::new(Duration::ZERO, Arc::new(NoJitter));
        let mut calls = 0u32;

        let result = run_with_retry(
            &fast_policy(3),
            RetryContext {
                delays: &delays,
                sleeper: &sleeper,
                cancel: &token,
                label: "GET:/test:",
            },
            |_| {
                calls += 1;
                token.cancel();
                async { Err::<(), _>(RequestError::transport("reset")) }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err(RequestError::Aborted));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn success_after_transient_failures() {
        let sleeper = RecordingSleeper::default();
        let token = CancellationToken::new();
        let delays = DelayCalculator::new(Duration::ZERO, Arc::new(NoJitter));

        let result = run_with_retry(
            &fast_policy(3),
            RetryContext {
                delays: &delays,
                sleeper: &sleeper,
                cancel: &token,
                label: "GET:/test:",
            },
            |attempt| async move {
                if attempt < 2 {
                    Err(RequestError::Http {
                        status: 503,
                        body: String::new(),
                    })
                } else {
                    Ok(attempt)
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result, Ok(2));
    }

    #[test]
    fn override_replaces_only_set_fields() {
        let base = RetryPolicy::default();
        let merged = base.merged(&RetryOverride::max_retries(0).with_base_delay_ms(5));
        assert_eq!(merged.max_retries, 0);
        assert_eq!(merged.base_delay_ms, 5);
        assert_eq!(merged.max_delay_ms, base.max_delay_ms);
        assert_eq!(merged.backoff_factor, base.backoff_factor);
    }

    #[test]
    fn override_predicate_takes_effect() {
        let merged = RetryPolicy::default().merged(&RetryOverride::default().with_predicate(|_| false));
        assert!(!merged.should_retry(&RequestError::transport("down")));
    }

    #[test]
    fn validation_rejects_bad_factor_and_inverted_bounds() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_backoff_factor(1.0).validate().is_err());
        assert!(RetryPolicy::default().with_backoff_factor(f64::NAN).validate().is_err());
        assert!(RetryPolicy::default()
            .with_base_delay_ms(20_000)
            .validate()
            .is_err());
    }
}
