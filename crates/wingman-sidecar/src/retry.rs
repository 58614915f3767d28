//! Bounded retry and polling loops.
//!
//! Both loops sleep through a [`Delay`] and check a [`CancellationToken`]
//! before every attempt and while waiting, so a cancelled caller never sits
//! out a backoff.

use crate::delay::Delay;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type DelayFn = Box<dyn Fn(u32) -> Duration + Send + Sync>;
type RetryPredicate<E> = Box<dyn Fn(&E, u32) -> bool + Send + Sync>;

/// How many times to try and how long to wait in between.
///
/// Attempt numbers handed to the predicate and the delay function are
/// 1-based and stop at `max_attempts - 1`: there is no "retry" after the last
/// attempt, so neither is consulted for it.
pub struct RetryPolicy<E> {
    max_attempts: u32,
    delay_for_attempt: DelayFn,
    should_retry: RetryPredicate<E>,
}

impl<E> RetryPolicy<E> {
    /// Retries every error with a constant pause.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_for_attempt: Box::new(move |_| interval),
            should_retry: Box::new(|_, _| true),
        }
    }

    /// Doubles the pause after every failed attempt, capped at `max_delay`.
    pub fn exponential(max_attempts: u32, base: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_for_attempt: Box::new(move |attempt| {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max_delay)
            }),
            should_retry: Box::new(|_, _| true),
        }
    }

    pub fn with_delay(mut self, delay_for_attempt: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.delay_for_attempt = Box::new(delay_for_attempt);
        self
    }

    pub fn retry_if(mut self, should_retry: impl Fn(&E, u32) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Box::new(should_retry);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        (self.delay_for_attempt)(attempt)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The last attempt's error, either because the budget ran out or because
    /// the predicate declined to retry it.
    Failed { error: E, attempts: u32 },
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn into_error(self) -> Option<E> {
        match self {
            RetryError::Failed { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs `operation` until it succeeds, the policy declines, or the budget is
/// spent. `before_retry` runs after a retryable failure and before the pause.
pub async fn retry<T, E, Op, Fut, Hook, HookFut>(
    policy: &RetryPolicy<E>,
    delay: &dyn Delay,
    cancel: &CancellationToken,
    mut operation: Op,
    mut before_retry: Hook,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Hook: FnMut(u32, &E) -> HookFut,
    HookFut: Future<Output = ()>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= policy.max_attempts || !(policy.should_retry)(&error, attempt) {
            return Err(RetryError::Failed {
                error,
                attempts: attempt,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = before_retry(attempt, &error) => {}
        }

        let pause = policy.delay_for_attempt(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = delay.sleep(pause) => {}
        }
        attempt += 1;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    /// Every attempt produced a result the predicate rejected; carries the last one.
    Exhausted(Option<T>),
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

/// Calls `probe` up to `max_attempts` times with a fixed `interval` until
/// `accept` approves the result. Unlike [`retry`], nothing here is an error.
pub async fn poll_until<T, Probe, Fut, Accept>(
    max_attempts: u32,
    interval: Duration,
    delay: &dyn Delay,
    cancel: &CancellationToken,
    mut probe: Probe,
    accept: Accept,
) -> PollOutcome<T>
where
    Probe: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
    Accept: Fn(&T) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut last = None;
    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        let value = probe(attempt).await;
        if accept(&value) {
            return PollOutcome::Ready(value);
        }
        last = Some(value);
        if attempt < max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = delay.sleep(interval) => {}
            }
        }
    }
    PollOutcome::Exhausted(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::RecordingDelay;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn no_hook(_: u32, _: &String) -> std::future::Ready<()> {
        std::future::ready(())
    }

    #[tokio::test]
    async fn always_failing_operation_runs_exactly_max_attempts() {
        let policy = RetryPolicy::<String>::fixed(4, Duration::from_millis(10));
        let delay = RecordingDelay::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(
            &policy,
            &delay,
            &CancellationToken::new(),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure #{attempt}")) }
            },
            |_, _| async {},
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            result,
            Err(RetryError::Failed {
                error: "failure #4".to_string(),
                attempts: 4
            })
        );
        assert_eq!(delay.calls().len(), 3);
    }

    #[tokio::test]
    async fn predicate_refusal_stops_immediately() {
        let policy = RetryPolicy::<String>::fixed(10, Duration::from_secs(1))
            .retry_if(|error, _| error != "fatal");
        let delay = RecordingDelay::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(
            &policy,
            &delay,
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
            no_hook,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Failed { attempts: 1, .. })));
        assert!(delay.calls().is_empty());
    }

    #[tokio::test]
    async fn attempts_seen_by_policy_never_reach_the_budget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_retry = seen.clone();
        let seen_delay = Arc::new(Mutex::new(Vec::new()));
        let seen_delay_inner = seen_delay.clone();
        let policy = RetryPolicy::<String>::fixed(3, Duration::ZERO)
            .retry_if(move |_, attempt| {
                seen_retry.lock().unwrap().push(attempt);
                true
            })
            .with_delay(move |attempt| {
                seen_delay_inner.lock().unwrap().push(attempt);
                Duration::ZERO
            });

        let _: Result<(), _> = retry(
            &policy,
            &RecordingDelay::new(),
            &CancellationToken::new(),
            |_| async { Err("nope".to_string()) },
            no_hook,
        )
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(*seen_delay.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn hook_runs_before_each_retry_and_success_stops_loop() {
        let policy = RetryPolicy::<String>::fixed(5, Duration::ZERO);
        let hooks = Mutex::new(Vec::new());

        let result = retry(
            &policy,
            &RecordingDelay::new(),
            &CancellationToken::new(),
            |attempt| async move {
                if attempt < 3 {
                    Err(format!("e{attempt}"))
                } else {
                    Ok(attempt)
                }
            },
            |attempt, error: &String| {
                hooks.lock().unwrap().push((attempt, error.clone()));
                async {}
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(
            *hooks.lock().unwrap(),
            vec![(1, "e1".to_string()), (2, "e2".to_string())]
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_between_attempts() {
        let policy = RetryPolicy::<String>::fixed(5, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let cancel_inner = cancel.clone();

        let result: Result<(), _> = retry(
            &policy,
            &crate::delay::TokioDelay,
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let cancel_inner = cancel_inner.clone();
                async move {
                    cancel_inner.cancel();
                    Err("boom".to_string())
                }
            },
            no_hook,
        )
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::<()>::exponential(
            6,
            Duration::from_millis(250),
            Duration::from_secs(1),
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn poll_until_returns_first_accepted_value() {
        let delay = RecordingDelay::new();
        let outcome = poll_until(
            10,
            Duration::from_millis(500),
            &delay,
            &CancellationToken::new(),
            |attempt| async move { attempt },
            |value| *value == 3,
        )
        .await;
        assert_eq!(outcome, PollOutcome::Ready(3));
        assert_eq!(delay.calls(), vec![Duration::from_millis(500); 2]);
    }

    #[tokio::test]
    async fn poll_until_reports_exhaustion_with_last_value() {
        let delay = RecordingDelay::new();
        let outcome = poll_until(
            3,
            Duration::from_millis(100),
            &delay,
            &CancellationToken::new(),
            |attempt| async move { attempt },
            |_| false,
        )
        .await;
        assert_eq!(outcome, PollOutcome::Exhausted(Some(3)));
        assert_eq!(delay.calls().len(), 2);
    }
}
