//! Orchestrator error types

use crate::key::ResourceKey;
use crate::poller::TerminalState;
use serde::Serialize;
use thiserror::Error;

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Operation already in progress: {0}")]
    AlreadyInProgress(ResourceKey),

    #[error("No active operation for: {0}")]
    UnknownKey(ResourceKey),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Backend reported unmapped status '{status}' for {key}")]
    UnmappedStatus { key: ResourceKey, status: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether this error is the typed not-found signal from a backend
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::ResourceNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Terminal failure of one operation within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub key: ResourceKey,
    pub state: TerminalState,
    pub error: String,
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.key, self.state, self.error)
    }
}

/// Every terminal failure collected from one orchestration run, in the
/// order the failures were observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateError {
    failures: Vec<OperationFailure>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: OperationFailure) {
        self.failures.push(failure);
    }

    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[OperationFailure] {
        &self.failures
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationFailure> {
        self.failures.iter()
    }

    /// Returns `Err(self)` when anything was collected
    pub fn into_result(self) -> std::result::Result<(), AggregateError> {
        if self.has_errors() { Err(self) } else { Ok(()) }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} operation(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl IntoIterator for AggregateError {
    type Item = OperationFailure;
    type IntoIter = std::vec::IntoIter<OperationFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}
