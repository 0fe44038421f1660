//! Dependency-ordered dispatch of a [`Plan`]
//!
//! Every operation gets its own task: register with the tracker, submit the
//! change to its backend, then poll until terminal. An operation is
//! dispatched only once all of its prerequisites converged; a failure blocks
//! its transitive dependents but never stops unrelated work.

use crate::action::{ActionType, Operation, Plan};
use crate::backend::{Backend, BackendRegistry};
use crate::error::{AggregateError, CloudError, OperationFailure, Result};
use crate::key::{ResourceKey, StatusToken};
use crate::poller::{
    Backoff, DEFAULT_MIN_INTERVAL, DEFAULT_NOT_FOUND_TOLERANCE, DEFAULT_TIMEOUT, PollEvent,
    PollSpec, Poller, TerminalState,
};
use crate::quota::QuotaFootprint;
use crate::refresh::{BackendRefresh, Observation, StateRefresh};
use crate::state::{GlobalState, ResourceState, StateManager};
use crate::tracker::{OperationHandle, Outcome, ResourceTracker};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Defaults used to build the [`PollSpec`] of every operation
#[derive(Debug, Clone)]
pub struct PollProfile {
    pub timeout: Duration,
    pub backoff: Backoff,
    pub min_interval: Duration,
    pub initial_delay: Duration,
    /// Absent ticks tolerated right after a create
    pub not_found_tolerance: u32,
    pub continuous_target: u32,
}

impl Default for PollProfile {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backoff: Backoff::default(),
            min_interval: DEFAULT_MIN_INTERVAL,
            initial_delay: Duration::ZERO,
            not_found_tolerance: DEFAULT_NOT_FOUND_TOLERANCE,
            continuous_target: 1,
        }
    }
}

impl PollProfile {
    /// Poll spec for `op`: action defaults, then the operation's overrides
    pub fn spec_for(&self, op: &Operation) -> PollSpec {
        let mut spec = match op.action {
            ActionType::Create => PollSpec::until([StatusToken::ACTIVE])
                .tolerate_not_found(self.not_found_tolerance),
            ActionType::Update => PollSpec::until([StatusToken::ACTIVE]),
            ActionType::Delete => PollSpec::deletion(),
        }
        .failing_on([StatusToken::FAILED])
        .timeout(self.timeout)
        .backoff(self.backoff.clone())
        .min_interval(self.min_interval)
        .initial_delay(self.initial_delay)
        .continuous_target(self.continuous_target);

        if let Some(target) = &op.poll.target {
            spec.target = target.iter().cloned().collect();
        }
        if let Some(failure) = &op.poll.failure {
            spec.failure = failure.iter().cloned().collect();
        }
        if let Some(pending) = &op.poll.pending {
            spec = spec.pending(pending.iter().cloned());
        }
        if let Some(secs) = op.poll.timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }
        spec
    }
}

/// Terminal result of one dispatched operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReport {
    pub key: ResourceKey,
    pub action: ActionType,
    pub state: TerminalState,
    pub status: Option<StatusToken>,
    /// Last observed resource attributes
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl OperationReport {
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    fn failure(&self) -> Option<OperationFailure> {
        if self.is_success() {
            return None;
        }
        Some(OperationFailure {
            key: self.key.clone(),
            state: self.state,
            error: self
                .error
                .clone()
                .unwrap_or_else(|| self.state.to_string()),
        })
    }
}

/// Result of one orchestration run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Dispatched operations in completion order
    pub operations: Vec<OperationReport>,
    /// Operations never dispatched (blocked by a failure, or cancelled)
    pub skipped: Vec<ResourceKey>,
    /// Footprint written at the end of a fully successful run
    pub footprint: Option<QuotaFootprint>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.operations.iter().all(OperationReport::is_success)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&OperationReport> {
        self.operations.iter().find(|r| &r.key == key)
    }

    pub fn converged(&self) -> impl Iterator<Item = &OperationReport> {
        self.operations.iter().filter(|r| r.is_success())
    }

    /// Every failed operation, in completion order
    pub fn failures(&self) -> AggregateError {
        let mut agg = AggregateError::new();
        for failure in self.operations.iter().filter_map(OperationReport::failure) {
            agg.push(failure);
        }
        agg
    }

    /// `Err(Aggregate)` if any operation failed or was never dispatched
    pub fn into_result(self) -> Result<RunReport> {
        let failures = self.failures();
        if failures.has_errors() {
            return Err(CloudError::Aggregate(failures));
        }
        if !self.skipped.is_empty() {
            // Only reachable through cancellation before dispatch
            return Err(CloudError::Cancelled(format!(
                "{} operation(s) not dispatched",
                self.skipped.len()
            )));
        }
        Ok(self)
    }
}

/// Runs plans against a set of backends
pub struct Orchestrator {
    registry: BackendRegistry,
    tracker: ResourceTracker,
    profile: PollProfile,
    state: Option<StateManager>,
    quota_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
    span: Span,
}

impl Orchestrator {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            tracker: ResourceTracker::new(),
            profile: PollProfile::default(),
            state: None,
            quota_dir: None,
            max_parallel: None,
            span: Span::current(),
        }
    }

    pub fn with_tracker(mut self, tracker: ResourceTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_profile(mut self, profile: PollProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Persist created resources through `state`
    pub fn with_state(mut self, state: StateManager) -> Self {
        self.state = Some(state);
        self
    }

    /// Write the quota footprint into `dir` after a successful run
    pub fn with_quota_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.quota_dir = Some(dir.into());
        self
    }

    /// Limit the number of operations in flight at once
    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit.max(1));
        self
    }

    /// Parent span for everything this orchestrator logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Run `plan` and fail with [`CloudError::Aggregate`] unless every
    /// operation converged
    pub async fn run(&self, plan: &Plan, cancel: CancellationToken) -> Result<RunReport> {
        self.execute(plan, cancel).await?.into_result()
    }

    /// Run `plan` to completion and report every outcome. Errors only when
    /// the plan is rejected up front or state cannot be persisted.
    pub async fn execute(&self, plan: &Plan, cancel: CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        plan.validate()?;
        for op in &plan.operations {
            self.registry.get(&op.key.provider)?;
        }

        let span = tracing::info_span!(parent: &self.span, "run", operations = plan.len());
        let lock = match &self.state {
            Some(manager) => Some(manager.acquire_lock().await?),
            None => None,
        };

        let mut report = self.dispatch(plan, &cancel).instrument(span.clone()).await;

        if let Some(manager) = &self.state {
            let persisted = persist(manager, &report).await;
            if let Some(lock) = lock {
                lock.release().await?;
            }
            persisted?;
        }

        if report.is_success() && !cancel.is_cancelled() {
            if let Some(dir) = &self.quota_dir {
                let footprint = QuotaFootprint::from_plan(plan);
                footprint.write(dir).instrument(span.clone()).await?;
                report.footprint = Some(footprint);
            }
        }

        report.elapsed = started.elapsed();
        let failed = report.operations.iter().filter(|r| !r.is_success()).count();
        span.in_scope(|| {
            tracing::info!(
                "Run finished in {:?}: {} converged, {} failed, {} skipped",
                report.elapsed,
                report.operations.len() - failed,
                failed,
                report.skipped.len()
            )
        });
        Ok(report)
    }

    async fn dispatch(&self, plan: &Plan, cancel: &CancellationToken) -> RunReport {
        let by_key: HashMap<&ResourceKey, &Operation> =
            plan.operations.iter().map(|op| (&op.key, op)).collect();
        let dependents = plan.dependents();
        let mut waiting: HashMap<&ResourceKey, usize> = plan
            .operations
            .iter()
            .map(|op| (&op.key, op.depends_on.iter().collect::<HashSet<_>>().len()))
            .collect();
        let mut ready: VecDeque<&Operation> = plan
            .operations
            .iter()
            .filter(|op| waiting[&op.key] == 0)
            .collect();

        let semaphore = self.max_parallel.map(|n| Arc::new(Semaphore::new(n)));
        let mut tasks: JoinSet<OperationReport> = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut dispatched: HashSet<ResourceKey> = HashSet::new();
        let mut blocked: HashSet<ResourceKey> = HashSet::new();
        let mut report = RunReport::default();

        loop {
            while let Some(op) = ready.pop_front() {
                if cancel.is_cancelled() {
                    continue;
                }
                dispatched.insert(op.key.clone());

                let started = self.registry.get(&op.key.provider).and_then(|backend| {
                    let handle = self.tracker.begin(op.key.clone(), op.action)?;
                    Ok((handle, backend))
                });
                let (handle, backend) = match started {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Cannot dispatch {}: {}", op.key, e);
                        blocked.extend(plan.transitive_dependents(&op.key));
                        report.operations.push(rejected(op, e));
                        continue;
                    }
                };

                let op_span = tracing::info_span!(
                    "operation",
                    key = %op.key,
                    action = %op.action
                );
                let task = execute_operation(
                    op.clone(),
                    backend,
                    handle,
                    self.profile.spec_for(op),
                    cancel.clone(),
                    semaphore.clone(),
                    op_span.clone(),
                );
                let id = tasks.spawn(task.instrument(op_span)).id();
                in_flight.insert(id, op.key.clone());
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let finished = match joined {
                Ok((id, finished)) => {
                    in_flight.remove(&id);
                    finished
                }
                Err(e) => {
                    let Some(key) = in_flight.remove(&e.id()) else {
                        continue;
                    };
                    tracing::error!("Worker for {} died: {}", key, e);
                    let op = by_key[&key];
                    rejected(op, CloudError::ApiError(format!("worker task failed: {}", e)))
                }
            };

            if finished.is_success() {
                for dependent in dependents.get(&finished.key).into_iter().flatten() {
                    if let Some(count) = waiting.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 && !blocked.contains(*dependent) {
                            ready.push_back(by_key[*dependent]);
                        }
                    }
                }
            } else {
                let downstream = plan.transitive_dependents(&finished.key);
                if !downstream.is_empty() {
                    tracing::warn!(
                        "{} {}; not dispatching {} dependent operation(s)",
                        finished.key,
                        finished.state,
                        downstream.len()
                    );
                }
                blocked.extend(downstream);
            }
            report.operations.push(finished);
        }

        report.skipped = plan
            .operations
            .iter()
            .filter(|op| !dispatched.contains(&op.key))
            .map(|op| op.key.clone())
            .collect();
        report
    }
}

fn rejected(op: &Operation, error: CloudError) -> OperationReport {
    OperationReport {
        key: op.key.clone(),
        action: op.action,
        state: TerminalState::Failed,
        status: None,
        value: None,
        error: Some(error.to_string()),
        attempts: 0,
        elapsed: Duration::ZERO,
    }
}

/// Submit `op` to its backend (unless the resource is already where a
/// create or delete would put it) and poll it to a terminal state.
async fn execute_operation(
    op: Operation,
    backend: Arc<dyn Backend>,
    handle: OperationHandle,
    spec: PollSpec,
    cancel: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
    span: Span,
) -> OperationReport {
    let started = Instant::now();
    let finish = |handle: OperationHandle, state, error: Option<String>| {
        if let Err(e) = handle.complete(Outcome::new(state, error.clone())) {
            tracing::error!("Failed to complete record for {}: {}", op.key, e);
        }
        OperationReport {
            key: op.key.clone(),
            action: op.action,
            state,
            status: None,
            value: None,
            error,
            attempts: 0,
            elapsed: started.elapsed(),
        }
    };

    let _permit = match semaphore {
        Some(semaphore) => tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(handle, TerminalState::Cancelled, Some("run cancelled".into()));
            }
            permit = semaphore.acquire_owned() => permit.ok(),
        },
        None => None,
    };

    // The deadline covers the existence check and submit as well as polling
    let timeout = spec.timeout;
    let deadline = Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(u32::MAX as u64));

    let refresh = BackendRefresh::new(backend.clone());
    let prepared = tokio::select! {
        biased;
        prepared = prepare(&op, backend.as_ref(), &refresh, &cancel) => prepared,
        _ = sleep_until(deadline) => Err((
            TerminalState::TimedOut,
            format!("backend did not respond within {:?}", timeout),
        )),
    };
    if let Err((state, error)) = prepared {
        return finish(handle, state, Some(error));
    }

    let spec = spec.timeout(deadline.saturating_duration_since(Instant::now()));
    let outcome = Poller::new(spec)
        .with_span(span)
        .run(&op.key, &refresh, &cancel, |event| {
            if let PollEvent::Observed(status) = event {
                handle.observe(status);
            }
        })
        .await;

    let mut report = finish(handle, outcome.state, outcome.error.clone());
    report.status = outcome.status().cloned();
    report.value = match outcome.last {
        Some(Observation::Present { value, .. }) => Some(value),
        _ => None,
    };
    report.attempts = outcome.attempts;
    report
}

async fn prepare(
    op: &Operation,
    backend: &dyn Backend,
    refresh: &BackendRefresh,
    cancel: &CancellationToken,
) -> std::result::Result<(), (TerminalState, String)> {
    let cancelled = || (TerminalState::Cancelled, "run cancelled".to_string());

    let submit = match op.action {
        ActionType::Update => true,
        ActionType::Create | ActionType::Delete => {
            let probe = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                probe = refresh.refresh(&op.key) => probe,
            };
            match probe {
                Ok(Observation::Absent) if op.action == ActionType::Delete => {
                    tracing::info!("{} already absent", op.key);
                    false
                }
                Ok(Observation::Absent) => true,
                Ok(Observation::Present { status, .. }) if op.action == ActionType::Create => {
                    tracing::info!("{} already exists ({}), adopting", op.key, status);
                    false
                }
                Ok(Observation::Present { .. }) => true,
                Err(e) => return Err((TerminalState::Failed, e.to_string())),
            }
        }
    };

    if submit {
        tracing::info!("Submitting {} {}", op.action, op.key);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            submitted = backend.submit(op) => submitted
                .map_err(|e| (TerminalState::Failed, format!("submit failed: {}", e)))?,
        }
    }
    Ok(())
}

/// Record converged creates/updates and forget converged deletes
async fn persist(manager: &StateManager, report: &RunReport) -> Result<()> {
    let mut state: GlobalState = manager.load().await?;
    let mut changed = false;

    for op in report.converged() {
        match op.action {
            ActionType::Create | ActionType::Update => {
                let value = op.value.clone().unwrap_or(serde_json::Value::Null);
                let mut resource = ResourceState::from_observed(&op.key, &value, op.status.clone());
                if let Some(previous) = state.get_resource(&op.key) {
                    resource.created_at = previous.created_at;
                }
                state.set_resource(&op.key, resource);
                changed = true;
            }
            ActionType::Delete => {
                changed |= state.remove_resource(&op.key).is_some();
            }
        }
    }

    if changed {
        manager.save(&state).await?;
    }
    Ok(())
}
