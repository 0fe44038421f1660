//! In-flight operation registry
//!
//! [`ResourceTracker`] guarantees at most one active operation per
//! [`ResourceKey`]. The live record is only reachable through the
//! [`OperationHandle`] returned by [`ResourceTracker::begin`]; everyone else
//! sees copies from [`ResourceTracker::snapshot`].

use crate::action::ActionType;
use crate::error::{CloudError, Result};
use crate::key::{ResourceKey, StatusToken};
use crate::poller::TerminalState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Terminal outcome handed to [`ResourceTracker::complete`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub state: TerminalState,
    pub error: Option<String>,
}

impl Outcome {
    pub fn converged() -> Self {
        Self {
            state: TerminalState::Converged,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TerminalState::Failed,
            error: Some(error.into()),
        }
    }

    pub fn new(state: TerminalState, error: Option<String>) -> Self {
        Self { state, error }
    }
}

/// One in-flight or completed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub key: ResourceKey,
    pub action: ActionType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Most recently observed status
    pub status: Option<StatusToken>,

    /// Distinct statuses in the order they were first entered
    pub history: Vec<StatusToken>,

    /// Number of observations recorded
    pub observations: u32,

    /// Terminal state, once completed
    pub state: Option<TerminalState>,
    pub error: Option<String>,
}

impl OperationRecord {
    fn new(key: ResourceKey, action: ActionType) -> Self {
        Self {
            key,
            action,
            started_at: Utc::now(),
            finished_at: None,
            status: None,
            history: Vec::new(),
            observations: 0,
            state: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_none()
    }
}

struct ActiveRecord {
    /// Distinguishes successive operations on the same key
    generation: u64,
    record: OperationRecord,
}

#[derive(Default)]
struct Registry {
    active: HashMap<ResourceKey, ActiveRecord>,
    archived: Vec<OperationRecord>,
    next_generation: u64,
}

/// Registry of operations, shared by cloning
#[derive(Clone, Default)]
pub struct ResourceTracker {
    inner: Arc<Mutex<Registry>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panicking holder cannot leave the map half-updated: every
        // mutation below is a single insert/remove/push.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new active operation for `key`
    pub fn begin(&self, key: ResourceKey, action: ActionType) -> Result<OperationHandle> {
        let mut registry = self.lock();
        if registry.active.contains_key(&key) {
            return Err(CloudError::AlreadyInProgress(key));
        }
        let generation = registry.next_generation;
        registry.next_generation += 1;
        registry.active.insert(
            key.clone(),
            ActiveRecord {
                generation,
                record: OperationRecord::new(key.clone(), action),
            },
        );
        tracing::debug!("Began {} {}", action, key);

        Ok(OperationHandle {
            key,
            generation,
            tracker: self.clone(),
            done: false,
        })
    }

    /// Record the terminal outcome for `key` and archive its record
    pub fn complete(&self, key: &ResourceKey, outcome: Outcome) -> Result<OperationRecord> {
        self.finish(key, None, outcome)
    }

    /// Archive the active record for `key`, only if it is `generation` when given
    fn finish(
        &self,
        key: &ResourceKey,
        generation: Option<u64>,
        outcome: Outcome,
    ) -> Result<OperationRecord> {
        let mut registry = self.lock();
        let matches = registry
            .active
            .get(key)
            .is_some_and(|active| generation.is_none_or(|g| g == active.generation));
        if !matches {
            return Err(CloudError::UnknownKey(key.clone()));
        }
        let Some(ActiveRecord { mut record, .. }) = registry.active.remove(key) else {
            return Err(CloudError::UnknownKey(key.clone()));
        };

        record.state = Some(outcome.state);
        record.error = outcome.error;
        record.finished_at = Some(Utc::now());
        registry.archived.push(record.clone());
        tracing::debug!("Completed {} as {}", key, outcome.state);

        Ok(record)
    }

    fn observe(&self, key: &ResourceKey, generation: u64, status: &StatusToken) {
        let mut registry = self.lock();
        if let Some(ActiveRecord { record, .. }) = registry
            .active
            .get_mut(key)
            .filter(|active| active.generation == generation)
        {
            record.observations += 1;
            if record.status.as_ref() != Some(status) {
                record.history.push(status.clone());
            }
            record.status = Some(status.clone());
        }
    }

    /// Copies of every active and archived record, oldest first
    pub fn snapshot(&self) -> Vec<OperationRecord> {
        let registry = self.lock();
        let mut records: Vec<OperationRecord> = registry
            .archived
            .iter()
            .chain(registry.active.values().map(|active| &active.record))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
        records
    }

    /// Copy of the record for `key`, active or most recently archived
    pub fn get(&self, key: &ResourceKey) -> Option<OperationRecord> {
        let registry = self.lock();
        registry
            .active
            .get(key)
            .map(|active| &active.record)
            .or_else(|| registry.archived.iter().rev().find(|r| &r.key == key))
            .cloned()
    }

    pub fn is_active(&self, key: &ResourceKey) -> bool {
        self.lock().active.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("ResourceTracker")
            .field("active", &registry.active.len())
            .field("archived", &registry.archived.len())
            .finish()
    }
}

/// Exclusive write access to one active record.
///
/// Dropping a handle without completing it archives the record as failed,
/// so the key is never left locked.
#[derive(Debug)]
pub struct OperationHandle {
    key: ResourceKey,
    generation: u64,
    tracker: ResourceTracker,
    done: bool,
}

impl OperationHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Mirror an observed status into the record
    pub fn observe(&self, status: &StatusToken) {
        self.tracker.observe(&self.key, self.generation, status);
    }

    pub fn complete(mut self, outcome: Outcome) -> Result<OperationRecord> {
        self.done = true;
        self.tracker.finish(&self.key, Some(self.generation), outcome)
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!("Operation for {} abandoned", self.key);
            let _ = self.tracker.finish(
                &self.key,
                Some(self.generation),
                Outcome::failed("operation abandoned"),
            );
        }
    }
}
