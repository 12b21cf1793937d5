//! Retry operation driving one connect cycle
//!
//! A [`RetryOperation`] is built from a delay schedule and governs a single
//! "keep trying until success or give up" cycle. The caller starts it with
//! [`attempt`](RetryOperation::attempt), reports every failure with
//! [`retry`](RetryOperation::retry), and stops it once the work succeeded.
//!
//! # Lifecycle
//!
//! ```text
//! attempt ──▶ on_attempt(1)
//!                 │ failure
//!                 ▼
//!            retry(err) ── true ──▶ sleep(delay) ──▶ on_attempt(n + 1)
//!                 │
//!               false (schedule exhausted, retry time elapsed, stopped)
//! ```
//!
//! In forever mode an exhausted schedule keeps replaying its final delay,
//! and the error log is trimmed to the most recent failure so it does not
//! grow without bound.
//!
//! Timers are tokio tasks, so `retry` and watchdog arming must run inside a
//! tokio runtime. A timer that fires after [`stop`](RetryOperation::stop)
//! finds the stopped flag set and does nothing.

use crate::backoff::Backoff;
use relink_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type AttemptFn = Arc<dyn Fn(u32) + Send + Sync>;

/// Options of a retry operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOptions {
    /// Replay the last delay forever once the schedule is exhausted
    ///
    /// `None` resolves to `true` exactly when the backoff has unbounded
    /// retries.
    pub forever: Option<bool>,
    /// Advisory flag asking timers not to keep the process alive
    ///
    /// Tokio timers never keep a runtime alive on their own, so the flag is
    /// only recorded.
    pub unref: bool,
    /// Give up once this much time has passed since `attempt`
    pub max_retry_time: Option<Duration>,
}

impl RetryOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Force forever mode on or off
    pub fn with_forever(mut self, forever: bool) -> Self {
        self.forever = Some(forever);
        self
    }

    /// Set the advisory unref flag
    pub fn with_unref(mut self, unref: bool) -> Self {
        self.unref = unref;
        self
    }

    /// Bound the total retry time
    pub fn with_max_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.max_retry_time = Some(max_retry_time);
        self
    }
}

struct Inner {
    /// Copy of the schedule, kept only in forever mode
    cached: Vec<Duration>,
    remaining: VecDeque<Duration>,
    forever: bool,
    unref: bool,
    max_retry_time: Option<Duration>,
    attempts: u32,
    errors: Vec<Error>,
    started_at: Option<Instant>,
    on_attempt: Option<AttemptFn>,
    watchdog: Option<(Duration, AttemptFn)>,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
    watchdog_task: Option<JoinHandle<()>>,
    watchdog_seq: u64,
    stopped: bool,
}

impl Inner {
    fn cancel_watchdog(&mut self) {
        if let Some(task) = self.watchdog_task.take() {
            task.abort();
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(task) = self.timer.take() {
            task.abort();
        }
    }
}

/// Stateful driver of one retry cycle
///
/// Cloning yields another handle to the same operation.
#[derive(Clone)]
pub struct RetryOperation {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for RetryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RetryOperation")
            .field("attempts", &inner.attempts)
            .field("remaining", &inner.remaining.len())
            .field("forever", &inner.forever)
            .field("unref", &inner.unref)
            .field("errors", &inner.errors.len())
            .field("stopped", &inner.stopped)
            .finish()
    }
}

impl RetryOperation {
    /// Create an operation over a literal delay schedule
    ///
    /// `options.forever` defaults to `false` here since a literal schedule
    /// is always bounded.
    pub fn new(delays: Vec<Duration>, options: RetryOptions) -> Self {
        let forever = options.forever.unwrap_or(false);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                remaining: delays.iter().copied().collect(),
                cached: if forever { delays } else { Vec::new() },
                forever,
                unref: options.unref,
                max_retry_time: options.max_retry_time,
                attempts: 1,
                errors: Vec::new(),
                started_at: None,
                on_attempt: None,
                watchdog: None,
                timer: None,
                timer_seq: 0,
                watchdog_task: None,
                watchdog_seq: 0,
                stopped: false,
            })),
        }
    }

    /// Create an operation from a backoff policy
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the policy is invalid.
    pub fn from_backoff(backoff: &Backoff, options: RetryOptions) -> Result<Self> {
        let delays = backoff.delays()?;
        let options = RetryOptions {
            forever: Some(options.forever.unwrap_or_else(|| backoff.is_unbounded())),
            ..options
        };
        Ok(Self::new(delays, options))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the cycle, invoking `on_attempt(1)` synchronously
    pub fn attempt<F>(&self, on_attempt: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.start(Arc::new(on_attempt), None);
    }

    /// Start the cycle with a per-attempt watchdog
    ///
    /// `on_timeout(attempt)` runs when an attempt has not been settled by
    /// `retry` or `stop` within `timeout`. The watchdog is re-armed for
    /// every following attempt.
    pub fn attempt_with_timeout<F, T>(&self, on_attempt: F, timeout: Duration, on_timeout: T)
    where
        F: Fn(u32) + Send + Sync + 'static,
        T: Fn(u32) + Send + Sync + 'static,
    {
        self.start(Arc::new(on_attempt), Some((timeout, Arc::new(on_timeout))));
    }

    fn start(&self, on_attempt: AttemptFn, watchdog: Option<(Duration, AttemptFn)>) {
        let attempts = {
            let mut inner = self.lock();
            inner.on_attempt = Some(on_attempt.clone());
            inner.watchdog = watchdog;
            inner.started_at = Some(Instant::now());
            arm_watchdog(&self.inner, &mut inner);
            inner.attempts
        };

        on_attempt(attempts);
    }

    /// Report a failed attempt
    ///
    /// Returns `true` when another attempt has been scheduled, `false` when
    /// the operation gives up: schedule exhausted outside forever mode,
    /// maximum retry time elapsed, or operation stopped.
    pub fn retry(&self, error: Error) -> bool {
        let mut inner = self.lock();
        inner.cancel_watchdog();

        if inner.stopped {
            inner.errors.push(error);
            return false;
        }

        if let (Some(max), Some(started_at)) = (inner.max_retry_time, inner.started_at) {
            if started_at.elapsed() >= max {
                inner.errors.push(error);
                inner.errors.insert(0, Error::RetryTimeout);
                return false;
            }
        }

        inner.errors.push(error);

        let delay = match inner.remaining.pop_front() {
            Some(delay) => delay,
            None if inner.forever => match inner.cached.last().copied() {
                Some(delay) => {
                    let keep_from = inner.errors.len().saturating_sub(1);
                    inner.errors.drain(..keep_from);
                    delay
                }
                None => return false,
            },
            None => return false,
        };

        inner.cancel_timer();
        inner.timer_seq += 1;
        let seq = inner.timer_seq;
        let shared = self.inner.clone();

        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let (on_attempt, attempts) = {
                let mut inner = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if inner.stopped || inner.timer_seq != seq {
                    return;
                }
                inner.timer = None;
                inner.attempts += 1;
                arm_watchdog(&shared, &mut inner);
                (inner.on_attempt.clone(), inner.attempts)
            };

            if let Some(on_attempt) = on_attempt {
                on_attempt(attempts);
            }
        }));

        true
    }

    /// The error reported most often, ties resolved by first occurrence
    pub fn main_error(&self) -> Option<Error> {
        let inner = self.lock();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for error in &inner.errors {
            *counts.entry(error.to_string()).or_default() += 1;
        }

        let mut best: Option<(&Error, usize)> = None;
        for error in &inner.errors {
            let count = counts.get(&error.to_string()).copied().unwrap_or(0);
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((error, count));
            }
        }

        best.map(|(error, _)| error.clone())
    }

    /// Cancel every timer and empty the schedule
    ///
    /// Idempotent and terminal. No callback fires after this returns and
    /// [`reset`](Self::reset) cannot revive the operation.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        inner.cancel_timer();
        inner.cancel_watchdog();
        inner.remaining.clear();
        inner.cached.clear();
        inner.on_attempt = None;
        inner.watchdog = None;
    }

    /// Restart the schedule from its first delay
    ///
    /// The attempt count goes back to 1; the error log is kept. Only a
    /// forever operation keeps a copy of its schedule, so resetting any
    /// other operation leaves it with nothing left to retry. A stopped
    /// operation stays stopped.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.cancel_timer();
        inner.cancel_watchdog();
        inner.attempts = 1;
        inner.remaining = inner.cached.iter().copied().collect();
    }

    /// Current attempt number, starting at 1
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Errors reported so far
    pub fn errors(&self) -> Vec<Error> {
        self.lock().errors.clone()
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Whether the operation runs in forever mode
    pub fn is_forever(&self) -> bool {
        self.lock().forever
    }

    /// The advisory unref flag
    pub fn is_unref(&self) -> bool {
        self.lock().unref
    }
}

fn arm_watchdog(shared: &Arc<Mutex<Inner>>, inner: &mut Inner) {
    inner.cancel_watchdog();

    let Some((timeout, _)) = inner.watchdog.as_ref() else {
        return;
    };
    let timeout = *timeout;
    let weak = Arc::downgrade(shared);
    inner.watchdog_seq += 1;
    let seq = inner.watchdog_seq;

    inner.watchdog_task = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let (on_timeout, attempts) = {
            let mut inner = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if inner.stopped || inner.watchdog_seq != seq {
                return;
            }
            inner.watchdog_task = None;
            (
                inner.watchdog.as_ref().map(|(_, callback)| callback.clone()),
                inner.attempts,
            )
        };

        if let Some(on_timeout) = on_timeout {
            on_timeout(attempts);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use tokio::sync::mpsc;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn recorder() -> (impl Fn(u32) + Send + Sync + 'static, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |attempt| {
            let _ = tx.send(attempt);
        }, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_is_synchronous() {
        let operation = RetryOperation::new(vec![ms(10)], RetryOptions::default());
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_schedules_next_attempt() {
        let operation = RetryOperation::new(vec![ms(100), ms(200)], RetryOptions::default());
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));

        let before = Instant::now();
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(2));
        assert!(before.elapsed() >= ms(100));

        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(operation.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_without_forever() {
        let operation = RetryOperation::new(vec![ms(10)], RetryOptions::default());
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(2));

        assert!(!operation.retry(Error::NotConnected));
        assert_eq!(operation.errors().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forever_replays_last_delay() {
        let options = RetryOptions::default().with_forever(true);
        let operation = RetryOperation::new(vec![ms(10), ms(50)], options);
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));

        for expected in 2..=6 {
            let before = Instant::now();
            assert!(operation.retry(Error::WebSocket(format!("failure {}", expected))));
            assert_eq!(rx.recv().await, Some(expected));

            if expected > 3 {
                assert!(before.elapsed() >= ms(50));
                assert_eq!(operation.errors().len(), 1);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_backoff_defaults_to_forever() {
        let backoff = Backoff::from(BackoffConfig::new().unbounded());
        let operation = RetryOperation::from_backoff(&backoff, RetryOptions::default()).unwrap();
        assert!(operation.is_forever());

        let backoff = Backoff::from(BackoffConfig::new().with_retries(2));
        let operation = RetryOperation::from_backoff(&backoff, RetryOptions::default()).unwrap();
        assert!(!operation.is_forever());
    }

    #[test]
    fn test_from_invalid_backoff() {
        let backoff = Backoff::from(
            BackoffConfig::new()
                .with_min_delay(ms(10))
                .with_max_delay(ms(5)),
        );
        assert!(matches!(
            RetryOperation::from_backoff(&backoff, RetryOptions::default()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retry_time() {
        let options = RetryOptions::default().with_max_retry_time(ms(150));
        let operation = RetryOperation::new(vec![ms(100); 5], options);
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(2));
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(3));

        // 200ms have passed since attempt
        assert!(!operation.retry(Error::NotConnected));
        let errors = operation.errors();
        assert_eq!(errors[0], Error::RetryTimeout);
        assert_eq!(errors.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let operation = RetryOperation::new(vec![ms(100)], RetryOptions::default());
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));
        assert!(operation.retry(Error::NotConnected));

        operation.stop();
        operation.stop();
        tokio::time::sleep(ms(500)).await;

        assert!(rx.try_recv().is_err());
        assert!(operation.is_stopped());
        assert!(!operation.retry(Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_per_attempt() {
        let operation = RetryOperation::new(vec![ms(10)], RetryOptions::default());
        let (on_attempt, mut attempts) = recorder();
        let (on_timeout, mut timeouts) = recorder();

        operation.attempt_with_timeout(on_attempt, ms(50), on_timeout);
        assert_eq!(attempts.recv().await, Some(1));
        assert_eq!(timeouts.recv().await, Some(1));

        assert!(operation.retry(Error::RequestTimeout));
        assert_eq!(attempts.recv().await, Some(2));
        assert_eq!(timeouts.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancels_watchdog() {
        let operation = RetryOperation::new(vec![ms(500)], RetryOptions::default());
        let (on_attempt, _attempts) = recorder();
        let (on_timeout, mut timeouts) = recorder();

        operation.attempt_with_timeout(on_attempt, ms(50), on_timeout);
        assert!(operation.retry(Error::NotConnected));

        tokio::time::sleep(ms(100)).await;
        assert!(timeouts.try_recv().is_err());
        operation.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forever_restarts_schedule() {
        let options = RetryOptions::default().with_forever(true);
        let operation = RetryOperation::new(vec![ms(10), ms(500)], options);
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(2));

        operation.reset();
        assert_eq!(operation.attempts(), 1);

        // First delay again, not the 500ms tail
        let before = Instant::now();
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(2));
        assert!(before.elapsed() < ms(500));
        operation.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_without_forever_leaves_empty_schedule() {
        let operation = RetryOperation::new(vec![ms(10), ms(10)], RetryOptions::default());
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));
        assert!(operation.retry(Error::NotConnected));
        assert_eq!(rx.recv().await, Some(2));

        operation.reset();
        assert_eq!(operation.attempts(), 1);
        assert!(!operation.retry(Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_stop_stays_stopped() {
        let options = RetryOptions::default().with_forever(true);
        let operation = RetryOperation::new(vec![ms(10)], options);
        let (on_attempt, mut rx) = recorder();

        operation.attempt(on_attempt);
        assert_eq!(rx.recv().await, Some(1));

        operation.stop();
        operation.reset();

        assert!(operation.is_stopped());
        assert!(!operation.retry(Error::NotConnected));
        tokio::time::sleep(ms(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_main_error() {
        let operation = RetryOperation::new(vec![], RetryOptions::default());
        assert_eq!(operation.main_error(), None);

        {
            let mut inner = operation.lock();
            inner.errors = vec![
                Error::WebSocket("refused".into()),
                Error::NotConnected,
                Error::NotConnected,
                Error::WebSocket("refused".into()),
                Error::RequestTimeout,
                Error::NotConnected,
            ];
        }
        assert_eq!(operation.main_error(), Some(Error::NotConnected));
    }

    #[test]
    fn test_main_error_tie_goes_to_first() {
        let operation = RetryOperation::new(vec![], RetryOptions::default());
        {
            let mut inner = operation.lock();
            inner.errors = vec![
                Error::RequestTimeout,
                Error::NotConnected,
                Error::NotConnected,
                Error::RequestTimeout,
            ];
        }
        assert_eq!(operation.main_error(), Some(Error::RequestTimeout));
    }

    #[test]
    fn test_unref_is_recorded() {
        let operation = RetryOperation::new(vec![], RetryOptions::default().with_unref(true));
        assert!(operation.is_unref());
    }
}
