//! Poll-until-converged primitive
//!
//! A [`Poller`] drives a [`StateRefresh`] until the observed status reaches
//! the caller's target set, hits a failure status, the deadline passes, or
//! the run is cancelled:
//!
//! ```text
//! Pending ──▶ Polling ──┬──▶ Converged
//!                       ├──▶ Failed
//!                       ├──▶ NotFound
//!                       ├──▶ TimedOut
//!                       └──▶ Cancelled
//! ```
//!
//! Once terminal, no further refresh calls are issued.

use crate::key::{ResourceKey, StatusToken};
use crate::refresh::{Observation, StateRefresh};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NOT_FOUND_TOLERANCE: u32 = 3;

/// Terminal state of a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Converged,
    Failed,
    TimedOut,
    NotFound,
    Cancelled,
}

impl TerminalState {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalState::Converged)
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalState::Converged => write!(f, "converged"),
            TerminalState::Failed => write!(f, "failed"),
            TerminalState::TimedOut => write!(f, "timed_out"),
            TerminalState::NotFound => write!(f, "not_found"),
            TerminalState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress notifications emitted while polling
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent<'a> {
    /// `Pending -> Polling`
    Polling,
    /// A refresh reported this status
    Observed(&'a StatusToken),
    /// A refresh reported the resource as absent
    Absent,
    /// `Polling -> terminal`; always the last event
    Finished(TerminalState),
}

/// What an absent resource means for this poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Absence {
    /// Absence is the goal (deletion flows)
    Converged,
    /// Absence is tolerated up to the not-found tolerance, then `NotFound`
    Unexpected,
}

/// Delay policy between poll ticks
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first tick
    pub initial: Duration,
    /// Upper bound for every delay, jitter included
    pub max: Duration,
    /// Growth factor per tick (1.0 = fixed interval)
    pub multiplier: f64,
    /// Symmetric jitter fraction in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: Duration::MAX,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after tick `attempt` (0-based) before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay after tick `attempt` (0-based), jittered and capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        // `jitter` may be set directly, bypassing `with_jitter`
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        if jitter == 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        let secs = base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Convergence criteria and timing for one poll
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub target: HashSet<StatusToken>,
    pub failure: HashSet<StatusToken>,
    /// When set, any status outside `pending`, `target` and `failure` fails the poll
    pub pending: Option<HashSet<StatusToken>>,
    pub absence: Absence,
    /// Consecutive absent ticks tolerated when absence is unexpected
    pub not_found_tolerance: u32,
    /// Consecutive target ticks required to converge
    pub continuous_target: u32,
    pub timeout: Duration,
    pub initial_delay: Duration,
    /// Floor applied to every backoff delay
    pub min_interval: Duration,
    pub backoff: Backoff,
}

impl PollSpec {
    /// Wait until the status is one of `target`
    pub fn until<I, T>(target: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<StatusToken>,
    {
        Self {
            target: target.into_iter().map(Into::into).collect(),
            failure: HashSet::new(),
            pending: None,
            absence: Absence::Unexpected,
            not_found_tolerance: 0,
            continuous_target: 1,
            timeout: DEFAULT_TIMEOUT,
            initial_delay: Duration::ZERO,
            min_interval: DEFAULT_MIN_INTERVAL,
            backoff: Backoff::default(),
        }
    }

    /// Wait until the resource is gone
    pub fn deletion() -> Self {
        Self::until([StatusToken::DELETED]).absent_converges()
    }

    pub fn failing_on<I, T>(mut self, failure: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<StatusToken>,
    {
        self.failure = failure.into_iter().map(Into::into).collect();
        self
    }

    pub fn pending<I, T>(mut self, pending: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<StatusToken>,
    {
        self.pending = Some(pending.into_iter().map(Into::into).collect());
        self
    }

    pub fn absent_converges(mut self) -> Self {
        self.absence = Absence::Converged;
        self
    }

    pub fn tolerate_not_found(mut self, checks: u32) -> Self {
        self.absence = Absence::Unexpected;
        self.not_found_tolerance = checks;
        self
    }

    pub fn continuous_target(mut self, ticks: u32) -> Self {
        self.continuous_target = ticks.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn min_interval(mut self, floor: Duration) -> Self {
        self.min_interval = floor;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .delay_for_attempt(attempt)
            .max(self.min_interval)
    }
}

/// Terminal result of a poll
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub state: TerminalState,
    /// Last observation before termination, if any refresh succeeded
    pub last: Option<Observation>,
    /// Error text for non-converged outcomes
    pub error: Option<String>,
    /// Number of refresh calls issued
    pub attempts: u32,
    pub elapsed: Duration,
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    pub fn status(&self) -> Option<&StatusToken> {
        self.last.as_ref().and_then(Observation::status)
    }
}

#[derive(Default)]
struct Progress {
    attempts: u32,
    last: Option<Observation>,
    target_streak: u32,
    absent_streak: u32,
}

type Verdict = (TerminalState, Option<String>);

/// Drives a [`StateRefresh`] to a terminal state
#[derive(Debug, Clone)]
pub struct Poller {
    spec: PollSpec,
    span: Span,
}

impl Poller {
    pub fn new(spec: PollSpec) -> Self {
        Self {
            spec,
            span: Span::current(),
        }
    }

    /// Log under `span` instead of the span current at construction
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn spec(&self) -> &PollSpec {
        &self.spec
    }

    /// Poll `key` until a terminal state. `on_event` sees every transition
    /// and observed status, ending with [`PollEvent::Finished`].
    pub async fn run<R, F>(
        &self,
        key: &ResourceKey,
        refresh: &R,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> PollOutcome
    where
        R: StateRefresh + ?Sized,
        F: FnMut(PollEvent<'_>) + Send,
    {
        let started = Instant::now();
        let mut progress = Progress::default();

        let (state, error) = self
            .drive(key, refresh, cancel, started, &mut progress, &mut on_event)
            .await;

        let elapsed = started.elapsed();
        {
            let _guard = self.span.enter();
            match state {
                TerminalState::Converged => tracing::debug!(
                    attempts = progress.attempts,
                    "{} converged after {:?}",
                    key,
                    elapsed
                ),
                _ => tracing::warn!(
                    attempts = progress.attempts,
                    "{} ended {}: {}",
                    key,
                    state,
                    error.as_deref().unwrap_or("-")
                ),
            }
        }
        on_event(PollEvent::Finished(state));

        PollOutcome {
            state,
            last: progress.last,
            error,
            attempts: progress.attempts,
            elapsed,
        }
    }

    async fn drive<R, F>(
        &self,
        key: &ResourceKey,
        refresh: &R,
        cancel: &CancellationToken,
        started: Instant,
        progress: &mut Progress,
        on_event: &mut F,
    ) -> Verdict
    where
        R: StateRefresh + ?Sized,
        F: FnMut(PollEvent<'_>) + Send,
    {
        let deadline = started
            .checked_add(self.spec.timeout)
            .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));
        let timed_out = || {
            (
                TerminalState::TimedOut,
                Some(format!("no convergence within {:?}", self.spec.timeout)),
            )
        };
        let cancelled = || (TerminalState::Cancelled, Some("run cancelled".to_string()));

        if cancel.is_cancelled() {
            return cancelled();
        }
        if !self.spec.initial_delay.is_zero()
            && pause(self.spec.initial_delay, deadline, cancel).await.is_some()
        {
            return cancelled();
        }
        on_event(PollEvent::Polling);

        loop {
            if cancel.is_cancelled() {
                return cancelled();
            }
            if Instant::now() >= deadline {
                return timed_out();
            }

            progress.attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(),
                _ = sleep_until(deadline) => return timed_out(),
                result = refresh.refresh(key) => result,
            };

            let observation = match result {
                Ok(observation) => observation,
                Err(e) => return (TerminalState::Failed, Some(e.to_string())),
            };

            if let Some(verdict) = self.judge(key, &observation, progress, on_event) {
                progress.last = Some(observation);
                return verdict;
            }
            progress.last = Some(observation);

            let delay = self.spec.delay_after(progress.attempts - 1);
            {
                let _guard = self.span.enter();
                tracing::trace!("{}: next refresh in {:?}", key, delay);
            }
            if pause(delay, deadline, cancel).await.is_some() {
                return cancelled();
            }
        }
    }

    fn judge<F>(
        &self,
        key: &ResourceKey,
        observation: &Observation,
        progress: &mut Progress,
        on_event: &mut F,
    ) -> Option<Verdict>
    where
        F: FnMut(PollEvent<'_>) + Send,
    {
        match observation {
            Observation::Absent => {
                on_event(PollEvent::Absent);
                progress.target_streak = 0;
                match self.spec.absence {
                    Absence::Converged => Some((TerminalState::Converged, None)),
                    Absence::Unexpected => {
                        progress.absent_streak += 1;
                        if progress.absent_streak > self.spec.not_found_tolerance {
                            Some((
                                TerminalState::NotFound,
                                Some(format!("{} does not exist", key)),
                            ))
                        } else {
                            None
                        }
                    }
                }
            }
            Observation::Present { status, .. } => {
                on_event(PollEvent::Observed(status));
                progress.absent_streak = 0;
                {
                    let _guard = self.span.enter();
                    tracing::debug!("{} is {}", key, status);
                }

                if self.spec.target.contains(status) {
                    progress.target_streak += 1;
                    if progress.target_streak >= self.spec.continuous_target.max(1) {
                        return Some((TerminalState::Converged, None));
                    }
                    return None;
                }
                progress.target_streak = 0;

                if self.spec.failure.contains(status) {
                    return Some((
                        TerminalState::Failed,
                        Some(format!("{} entered failure status {}", key, status)),
                    ));
                }
                if let Some(pending) = &self.spec.pending {
                    if !pending.contains(status) {
                        return Some((
                            TerminalState::Failed,
                            Some(format!("{} entered unexpected status {}", key, status)),
                        ));
                    }
                }
                None
            }
        }
    }
}

/// Sleeps for `delay` (cut short at `deadline`). Returns `Some(Cancelled)`
/// if the token fires first.
async fn pause(
    delay: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Option<TerminalState> {
    let wake = Instant::now()
        .checked_add(delay)
        .map_or(deadline, |at| at.min(deadline));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Some(TerminalState::Cancelled),
        _ = sleep_until(wake) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CloudError, Result};
    use crate::refresh::PollResult;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Step {
        Status(&'static str),
        Absent,
        Error(&'static str),
        Hang,
    }

    /// Replays `steps`; the last step repeats forever
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self) -> Step {
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            }
        }
    }

    #[async_trait]
    impl StateRefresh for Scripted {
        async fn refresh(&self, _key: &ResourceKey) -> PollResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.next_step() {
                Step::Status(s) => Ok(Observation::Present {
                    value: serde_json::json!({ "status": s }),
                    status: StatusToken::new(s),
                }),
                Step::Absent => Ok(Observation::Absent),
                Step::Error(msg) => Err(CloudError::ApiError(msg.to_string())),
                Step::Hang => std::future::pending::<Result<Observation>>().await,
            }
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new("aws", "vpc", "main")
    }

    fn create_spec() -> PollSpec {
        PollSpec::until([StatusToken::ACTIVE])
            .failing_on([StatusToken::FAILED])
            .backoff(Backoff::fixed(Duration::from_secs(2)))
            .timeout(Duration::from_secs(60))
    }

    async fn poll(spec: PollSpec, refresh: &Scripted) -> PollOutcome {
        Poller::new(spec)
            .run(&key(), refresh, &CancellationToken::new(), |_| {})
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_target() {
        let refresh = Scripted::new(vec![
            Step::Status("CREATING"),
            Step::Status("CREATING"),
            Step::Status("ACTIVE"),
        ]);
        let outcome = poll(create_spec(), &refresh).await;

        assert_eq!(outcome.state, TerminalState::Converged);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.status(), Some(&StatusToken::new("ACTIVE")));
        assert!(outcome.error.is_none());
        assert_eq!(refresh.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_on_failure_status() {
        let refresh = Scripted::new(vec![Step::Status("CREATING"), Step::Status("FAILED")]);
        let outcome = poll(create_spec(), &refresh).await;

        assert_eq!(outcome.state, TerminalState::Failed);
        assert!(outcome.error.unwrap().contains("failure status FAILED"));

        // No refresh after the terminal state
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(refresh.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_converges_on_absence() {
        let refresh = Scripted::new(vec![
            Step::Status("DELETING"),
            Step::Status("DELETING"),
            Step::Absent,
        ]);
        let spec = PollSpec::deletion()
            .failing_on([StatusToken::FAILED])
            .backoff(Backoff::fixed(Duration::from_secs(1)));
        let outcome = poll(spec, &refresh).await;

        assert_eq!(outcome.state, TerminalState::Converged);
        assert_eq!(outcome.last, Some(Observation::Absent));
        assert_eq!(refresh.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_absence_is_not_found() {
        let refresh = Scripted::new(vec![Step::Absent]);
        let outcome = poll(create_spec(), &refresh).await;

        assert_eq!(outcome.state, TerminalState::NotFound);
        assert_eq!(refresh.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absence_tolerated_after_create() {
        let refresh = Scripted::new(vec![Step::Absent, Step::Absent, Step::Status("ACTIVE")]);
        let outcome = poll(create_spec().tolerate_not_found(2), &refresh).await;
        assert_eq!(outcome.state, TerminalState::Converged);

        let refresh = Scripted::new(vec![Step::Absent]);
        let outcome = poll(create_spec().tolerate_not_found(2), &refresh).await;
        assert_eq!(outcome.state, TerminalState::NotFound);
        assert_eq!(refresh.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_error_fails_without_retry() {
        let refresh = Scripted::new(vec![Step::Status("CREATING"), Step::Error("throttled")]);
        let outcome = poll(create_spec(), &refresh).await;

        assert_eq!(outcome.state, TerminalState::Failed);
        assert!(outcome.error.unwrap().contains("throttled"));
        assert_eq!(refresh.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let refresh = Scripted::new(vec![Step::Status("CREATING")]);
        let spec = create_spec()
            .timeout(Duration::from_secs(10))
            .backoff(Backoff::fixed(Duration::from_secs(3)));
        let outcome = poll(spec, &refresh).await;

        assert_eq!(outcome.state, TerminalState::TimedOut);
        assert!(outcome.elapsed >= Duration::from_secs(10));
        assert!(outcome.elapsed < Duration::from_secs(11));
        // t = 0, 3, 6, 9
        assert_eq!(refresh.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_interrupts_hanging_refresh() {
        let refresh = Scripted::new(vec![Step::Hang]);
        let outcome = poll(create_spec().timeout(Duration::from_secs(5)), &refresh).await;

        assert_eq!(outcome.state, TerminalState::TimedOut);
        assert!(outcome.elapsed >= Duration::from_secs(5));
        assert!(outcome.elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let refresh = std::sync::Arc::new(Scripted::new(vec![Step::Status("CREATING")]));
        let cancel = CancellationToken::new();
        let events = std::sync::Arc::new(Mutex::new(Vec::new()));

        let task = {
            let refresh = refresh.clone();
            let cancel = cancel.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let spec = create_spec().backoff(Backoff::fixed(Duration::from_secs(5)));
                Poller::new(spec)
                    .run(&key(), refresh.as_ref(), &cancel, |event| {
                        events.lock().unwrap().push(match event {
                            PollEvent::Finished(state) => format!("finished:{}", state),
                            PollEvent::Observed(status) => format!("observed:{}", status),
                            PollEvent::Absent => "absent".to_string(),
                            PollEvent::Polling => "polling".to_string(),
                        });
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        let outcome = task.await.unwrap();

        assert_eq!(outcome.state, TerminalState::Cancelled);
        assert!(outcome.elapsed < Duration::from_secs(12 + 5));
        // t = 0, 5, 10
        assert_eq!(refresh.calls(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(refresh.calls(), 3);

        let events = events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("polling"));
        assert_eq!(events.last().map(String::as_str), Some("finished:cancelled"));
        assert_eq!(events.len(), 1 + 3 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_hanging_refresh() {
        let refresh = std::sync::Arc::new(Scripted::new(vec![Step::Hang]));
        let cancel = CancellationToken::new();

        let task = {
            let refresh = refresh.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Poller::new(create_spec())
                    .run(&key(), refresh.as_ref(), &cancel, |_| {})
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, TerminalState::Cancelled);
        assert_eq!(refresh.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_issues_no_calls() {
        let refresh = Scripted::new(vec![Step::Status("ACTIVE")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = Poller::new(create_spec())
            .run(&key(), &refresh, &cancel, |_| {})
            .await;
        assert_eq!(outcome.state, TerminalState::Cancelled);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(refresh.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_outside_pending_fails() {
        let refresh = Scripted::new(vec![Step::Status("CREATING"), Step::Status("STOPPED")]);
        let spec = create_spec().pending([StatusToken::CREATING]);
        let outcome = poll(spec, &refresh).await;

        assert_eq!(outcome.state, TerminalState::Failed);
        assert!(outcome.error.unwrap().contains("unexpected status STOPPED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_target_requires_streak() {
        let refresh = Scripted::new(vec![
            Step::Status("ACTIVE"),
            Step::Status("CREATING"),
            Step::Status("ACTIVE"),
            Step::Status("ACTIVE"),
        ]);
        let outcome = poll(create_spec().continuous_target(2), &refresh).await;

        assert_eq!(outcome.state, TerminalState::Converged);
        assert_eq!(refresh.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_floor_and_initial_delay() {
        let refresh = Scripted::new(vec![
            Step::Status("CREATING"),
            Step::Status("CREATING"),
            Step::Status("ACTIVE"),
        ]);
        let spec = create_spec()
            .backoff(Backoff::fixed(Duration::from_millis(1)))
            .min_interval(Duration::from_secs(1))
            .initial_delay(Duration::from_secs(4));
        let outcome = poll(spec, &refresh).await;

        assert_eq!(outcome.state, TerminalState::Converged);
        assert!(outcome.elapsed >= Duration::from_secs(4 + 2));
        assert!(outcome.elapsed < Duration::from_secs(7));
    }

    #[test]
    fn test_exponential_base_delay() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|n| backoff.base_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.base_delay(10_000), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_delay() {
        let backoff = Backoff::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(50), Duration::from_millis(250));
    }

    #[test]
    fn test_out_of_range_jitter_is_clamped() {
        let wild = Backoff {
            jitter: 1.5,
            ..Backoff::fixed(Duration::from_secs(4))
        };
        for _ in 0..200 {
            assert!(wild.delay_for_attempt(0) <= Duration::from_secs(8));
        }

        let nan = Backoff {
            jitter: f64::NAN,
            ..Backoff::fixed(Duration::from_secs(4))
        };
        assert_eq!(nan.delay_for_attempt(3), Duration::from_secs(4));

        let negative = Backoff {
            jitter: -0.5,
            ..Backoff::fixed(Duration::from_secs(4))
        };
        assert_eq!(negative.delay_for_attempt(0), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::exponential(Duration::from_secs(2), Duration::from_secs(5))
            .with_jitter(0.5);
        for _ in 0..200 {
            let first = backoff.delay_for_attempt(0);
            assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(3));

            let capped = backoff.delay_for_attempt(4);
            assert!(capped >= Duration::from_millis(2500) && capped <= Duration::from_secs(5));
        }
    }
}
