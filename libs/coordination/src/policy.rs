//! Fault-handling policies wrapped around backend calls.
//!
//! - [`CircuitBreaker`]: per-host, opens after consecutive recoverable
//!   failures and admits a single trial call after a cool-down.
//! - [`RetryPolicy`]: global, replays recoverable failures with exponential
//!   delay, by default without an attempt cap.
//! - [`ExponentialBackoff`]: delay schedule used to re-establish watches.
//!
//! None of these hold business data; [`FaultHandling`] composes them.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::CoordinationConfig;

use crate::error::{BackendError, BackendResult, CoordinationError, CoordinationResult};
use crate::metrics;

/// Doubling delay schedule with a ceiling, reset on success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        let cfg = config::wire::Backoff::default();
        Self::new(cfg.initial, cfg.max)
    }
}

impl From<config::wire::Backoff> for ExponentialBackoff {
    fn from(cfg: config::wire::Backoff) -> Self {
        Self::new(cfg.initial, cfg.max)
    }
}

/// Retry policy for recoverable backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Ceiling for the retry delay.
    pub max_delay: Duration,
    /// Total attempts including the first; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        config::wire::Retry::default().into()
    }
}

impl From<config::wire::Retry> for RetryPolicy {
    fn from(cfg: config::wire::Retry) -> Self {
        Self {
            base_delay: cfg.base_delay,
            max_delay: cfg.max_delay,
            max_attempts: cfg.max_attempts,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow; counts consecutive recoverable failures.
    Closed { failures: u32 },
    /// Calls are rejected until `until`.
    Open { until: Instant },
    /// Cool-down elapsed and the single trial call is outstanding.
    HalfOpen,
}

/// Consecutive-failure circuit breaker for a single backend host.
#[derive(Debug)]
pub struct CircuitBreaker {
    host: String,
    threshold: u32,
    cool_down: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, threshold: u32, cool_down: Duration) -> Self {
        Self {
            host: host.into(),
            threshold: threshold.max(1),
            cool_down,
            state: Mutex::new(CircuitState::Closed { failures: 0 }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    /// Ask permission to issue a call. Rejects with `CircuitOpen` while the
    /// breaker is open or while a half-open trial is outstanding.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`]
    /// or [`BreakerPermit::failure`]; a trial permit dropped unresolved
    /// hands the trial to the next caller.
    pub fn try_acquire(&self) -> CoordinationResult<BreakerPermit<'_>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match *state {
            CircuitState::Closed { .. } => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open { until } if now >= until => {
                debug!(host = %self.host, "circuit breaker half-open, admitting trial call");
                *state = CircuitState::HalfOpen;
                Ok(BreakerPermit::new(self, true))
            }
            CircuitState::Open { until } => Err(self.open_error(until - now)),
            CircuitState::HalfOpen => Err(self.open_error(Duration::ZERO)),
        }
    }

    /// Rejects only while the cool-down is running; never claims the
    /// half-open trial. For calls that wait on other holders.
    pub fn check(&self) -> CoordinationResult<()> {
        let now = Instant::now();
        match *self.state.lock() {
            CircuitState::Open { until } if now < until => Err(self.open_error(until - now)),
            _ => Ok(()),
        }
    }

    fn open_error(&self, retry_in: Duration) -> CoordinationError {
        CoordinationError::CircuitOpen {
            host: self.host.clone(),
            retry_in,
        }
    }

    fn abandon_trial(&self) {
        let mut state = self.state.lock();
        if *state == CircuitState::HalfOpen {
            debug!(host = %self.host, "circuit breaker trial abandoned");
            *state = CircuitState::Open {
                until: Instant::now(),
            };
        }
    }

    /// The call completed, or failed with an error the policy does not
    /// handle; either way the host answered.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if *state == CircuitState::HalfOpen {
            info!(host = %self.host, "circuit breaker closed after successful trial");
        }
        *state = CircuitState::Closed { failures: 0 };
    }

    /// The call failed with a recoverable error.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let open = CircuitState::Open {
            until: Instant::now() + self.cool_down,
        };
        match *state {
            CircuitState::Closed { failures } => {
                let failures = failures.saturating_add(1);
                if failures >= self.threshold {
                    warn!(
                        host = %self.host,
                        failures,
                        cool_down_ms = self.cool_down.as_millis(),
                        "circuit breaker opened"
                    );
                    metrics::CIRCUIT_OPENED.inc();
                    *state = open;
                } else {
                    *state = CircuitState::Closed { failures };
                }
            }
            CircuitState::HalfOpen => {
                warn!(host = %self.host, "circuit breaker trial failed, re-opening");
                metrics::CIRCUIT_OPENED.inc();
                *state = open;
            }
            // a call admitted before the breaker opened failed late
            CircuitState::Open { .. } => {}
        }
    }
}

/// Admission to call through a [`CircuitBreaker`].
#[must_use = "resolve the permit with `success` or `failure`"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// This permit carries the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.abandon_trial();
        }
    }
}

/// How a call is admitted through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Answers promptly; may carry the half-open trial.
    Unary,
    /// Waits on other holders (lock, campaign) for as long as it takes.
    /// Admitted unless the breaker is cooling down, never the trial, and
    /// timeouts while waiting are not held against the host.
    Wait,
}

/// The three fault policies applied to every connection.
#[derive(Debug)]
pub struct FaultHandling {
    threshold: u32,
    cool_down: Duration,
    retry: RetryPolicy,
    watch_backoff: config::wire::Backoff,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl FaultHandling {
    pub fn new(
        breaker: config::wire::Breaker,
        retry: RetryPolicy,
        watch_backoff: config::wire::Backoff,
    ) -> Self {
        Self {
            threshold: breaker.threshold,
            cool_down: breaker.cool_down,
            retry,
            watch_backoff,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self::new(
            config.breaker(),
            config.retry().into(),
            config.watch_backoff(),
        )
    }

    /// Per-host breaker, created on first use.
    pub fn breaker(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(host.to_owned()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(host, self.threshold, self.cool_down))
        }))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fresh backoff schedule for re-establishing a watch.
    pub fn watch_backoff(&self) -> ExponentialBackoff {
        self.watch_backoff.into()
    }

    /// Run `op` against `host` under the breaker and the global retry
    /// policy. Recoverable failures are replayed until they succeed, the
    /// retry budget runs out, the breaker opens, or `closed` is cancelled.
    pub async fn execute<T, F, Fut>(
        &self,
        host: &str,
        op_name: &'static str,
        closed: &CancellationToken,
        op: F,
    ) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        self.run(host, op_name, CallKind::Unary, closed, op).await
    }

    /// Like [`execute`](Self::execute) for calls that block until another
    /// holder lets go.
    pub async fn execute_wait<T, F, Fut>(
        &self,
        host: &str,
        op_name: &'static str,
        closed: &CancellationToken,
        op: F,
    ) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        self.run(host, op_name, CallKind::Wait, closed, op).await
    }

    async fn run<T, F, Fut>(
        &self,
        host: &str,
        op_name: &'static str,
        kind: CallKind,
        closed: &CancellationToken,
        mut op: F,
    ) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let breaker = self.breaker(host);
        let mut backoff = self.retry.backoff();
        let mut attempts = 0u32;
        loop {
            if closed.is_cancelled() {
                return Err(CoordinationError::NotConnected(format!(
                    "connection closed before {op_name} could complete"
                )));
            }
            let permit = match kind {
                CallKind::Unary => Some(breaker.try_acquire()?),
                CallKind::Wait => {
                    breaker.check()?;
                    None
                }
            };
            attempts = attempts.saturating_add(1);

            let result = op().await;
            let err = match result {
                Ok(value) => {
                    match permit {
                        Some(permit) => permit.success(),
                        None => breaker.record_success(),
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_recoverable() => {
                    match permit {
                        Some(permit) => permit.success(),
                        None => breaker.record_success(),
                    }
                    return Err(err.into());
                }
                Err(err) => err,
            };

            match permit {
                Some(permit) => permit.failure(),
                None if matches!(err, BackendError::Timeout(_)) => {}
                None => breaker.record_failure(),
            }
            if self.retry.exhausted(attempts) {
                warn!(host, op = op_name, attempts, error = %err, "retries exhausted");
                return Err(err.into());
            }

            let delay = backoff.next_delay();
            warn!(
                host,
                op = op_name,
                attempt = attempts,
                retry_in_ms = delay.as_millis(),
                error = %err,
                "recoverable backend error, retrying"
            );
            tokio::select! {
                _ = closed.cancelled() => {
                    return Err(CoordinationError::NotConnected(format!(
                        "connection closed while retrying {op_name}"
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for FaultHandling {
    fn default() -> Self {
        Self::new(
            config::wire::Breaker::default(),
            RetryPolicy::default(),
            config::wire::Backoff::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn faults(threshold: u32, max_attempts: Option<u32>) -> FaultHandling {
        FaultHandling::new(
            config::wire::Breaker {
                threshold,
                cool_down: Duration::from_secs(5),
            },
            RetryPolicy {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(2),
                max_attempts,
            },
            config::wire::Backoff::default(),
        )
    }

    #[test]
    fn test_backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(backoff.attempt(), 6);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_never_overflows() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("h1", 3, Duration::from_secs(5));
        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed { failures: 2 });

        breaker.try_acquire().unwrap().failure();
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));

        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, CoordinationError::CircuitOpen { ref host, .. } if host == "h1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_success_resets_count() {
        let breaker = CircuitBreaker::new("h1", 3, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_failure();
        breaker.try_acquire().unwrap().success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed { failures: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_single_trial() {
        let breaker = CircuitBreaker::new("h1", 1, Duration::from_secs(5));
        breaker.record_failure();
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        // exactly one trial is admitted
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_err());

        // trial fails: open for another cool-down
        trial.failure();
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(5)).await;

        // trial succeeds: closed
        breaker.try_acquire().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed { failures: 0 });
        assert!(!breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_abandoned_trial_is_handed_on() {
        let breaker = CircuitBreaker::new("h1", 1, Duration::from_secs(5));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = breaker.try_acquire().unwrap();
        drop(trial);
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));

        // the next caller gets the trial without another cool-down
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_check_never_claims_trial() {
        let breaker = CircuitBreaker::new("h1", 1, Duration::from_secs(5));
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        breaker.check().unwrap();
        breaker.check().unwrap();
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_call_does_not_wedge_breaker() {
        let faults = faults(1, None);
        let closed = CancellationToken::new();
        faults.breaker("h1").record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        // the trial call hangs and its caller gives up
        let hung = faults.execute("h1", "leader", &closed, || {
            futures::future::pending::<BackendResult<()>>()
        });
        assert!(
            tokio::time::timeout(Duration::from_secs(1), hung)
                .await
                .is_err()
        );

        // ten minutes later the host is reachable again
        tokio::time::advance(Duration::from_secs(600)).await;
        faults
            .execute("h1", "leader", &closed, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(faults.breaker("h1").state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_call_leaves_trial_to_others() {
        let faults = faults(1, None);
        let closed = CancellationToken::new();
        faults.breaker("h1").record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        let waiting = faults.execute_wait("h1", "campaign", &closed, || {
            futures::future::pending::<BackendResult<()>>()
        });
        tokio::pin!(waiting);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), &mut waiting)
                .await
                .is_err()
        );

        // unary calls still get through while the campaign waits
        faults
            .execute("h1", "leader", &closed, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(faults.breaker("h1").state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_call_timeouts_do_not_open_breaker() {
        let faults = faults(2, Some(5));
        let closed = CancellationToken::new();
        let calls = &AtomicU32::new(0);

        let err = faults
            .execute_wait("h1", "lock", &closed, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::Timeout("deadline exceeded".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.backend(), Some(&BackendError::Timeout("deadline exceeded".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(faults.breaker("h1").state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_recoverable_until_success() {
        let faults = faults(10, None);
        let calls = &AtomicU32::new(0);
        let closed = CancellationToken::new();

        let value = faults
            .execute("h1", "grant", &closed, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err(BackendError::Unavailable("electing".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(faults.breaker("h1").state(), CircuitState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_surfaces_terminal_immediately() {
        let faults = faults(3, None);
        let calls = &AtomicU32::new(0);
        let closed = CancellationToken::new();

        let err = faults
            .execute("h1", "lock", &closed, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::PermissionDenied("bad token".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::Backend(BackendError::PermissionDenied("bad token".into()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_stops_when_breaker_opens() {
        let faults = faults(3, None);
        let calls = &AtomicU32::new(0);
        let closed = CancellationToken::new();

        let err = faults
            .execute("h1", "grant", &closed, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::Transport("refused".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // other hosts are unaffected
        faults.breaker("h2").try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_respects_max_attempts() {
        let faults = faults(100, Some(2));
        let closed = CancellationToken::new();
        let err = faults
            .execute("h1", "grant", &closed, || async {
                Err::<(), _>(BackendError::Timeout("slow".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::Backend(BackendError::Timeout("slow".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_cancelled_while_retrying() {
        let faults = faults(100, None);
        let closed = CancellationToken::new();
        let canceller = closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let err = faults
            .execute("h1", "grant", &closed, || async {
                Err::<(), _>(BackendError::Timeout("slow".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
    }
}
