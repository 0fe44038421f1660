//! InfraFlow Cloud Orchestration
//!
//! This crate provides the provisioning core of InfraFlow: it dispatches
//! create/update/delete operations to pluggable backends in dependency
//! order, polls every resource until its lifecycle status converges, and
//! collects every failure of a run into one error.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  InfraFlow CLI                   │
//! │              (infra apply/destroy)               │
//! └─────────────────┬───────────────────────────────┘
//!                   │ Plan
//! ┌─────────────────▼───────────────────────────────┐
//! │                infraflow-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │              Orchestrator                 │   │
//! │  └───────┬──────────────────────┬───────────┘   │
//! │  ┌───────▼───────┐      ┌───────▼───────┐       │
//! │  │ResourceTracker│      │    Poller     │       │
//! │  └───────────────┘      └───────┬───────┘       │
//! │                         ┌───────▼───────┐       │
//! │                         │ StateRefresh  │       │
//! │                         └───────┬───────┘       │
//! └─────────────────────────────────┼───────────────┘
//!                                   │ trait Backend
//!                   ┌───────────────┴───────────────┐
//!           ┌───────▼───────┐               ┌───────▼───────┐
//!           │command backend│               │ other backends│
//!           └───────────────┘               └───────────────┘
//! ```

pub mod action;
pub mod backend;
pub mod error;
pub mod key;
pub mod orchestrator;
pub mod poller;
pub mod quota;
pub mod refresh;
pub mod state;
pub mod tracker;

// Re-exports
pub use action::{ActionType, Operation, Plan, PlanSummary, PollOverrides};
pub use backend::{Backend, BackendRegistry, Observed};
pub use error::{AggregateError, CloudError, OperationFailure, Result};
pub use key::{ResourceKey, StatusToken};
pub use orchestrator::{OperationReport, Orchestrator, PollProfile, RunReport};
pub use poller::{Absence, Backoff, PollEvent, PollOutcome, PollSpec, Poller, TerminalState};
pub use quota::{QUOTA_FILE, QuotaFootprint};
pub use refresh::{BackendRefresh, Observation, PollResult, StateRefresh};
pub use state::{GlobalState, ResourceState, StateLock, StateManager};
pub use tracker::{OperationHandle, OperationRecord, Outcome, ResourceTracker};

pub use tokio_util::sync::CancellationToken;
