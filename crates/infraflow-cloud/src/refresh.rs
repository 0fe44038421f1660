//! State refresh adapters
//!
//! A refresh turns one backend read into a uniform [`PollResult`]. It never
//! retries: retry and backoff belong to the [`Poller`](crate::poller::Poller).

use crate::backend::Backend;
use crate::error::{CloudError, Result};
use crate::key::{ResourceKey, StatusToken};
use async_trait::async_trait;
use std::sync::Arc;

/// What one refresh saw
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The resource exists and reports `status`
    Present {
        value: serde_json::Value,
        status: StatusToken,
    },
    /// The resource does not exist (yet, or any more)
    Absent,
}

impl Observation {
    pub fn status(&self) -> Option<&StatusToken> {
        match self {
            Observation::Present { status, .. } => Some(status),
            Observation::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Observation::Absent)
    }
}

/// Result of one poll tick. `Err` is fatal for the poll.
pub type PollResult = Result<Observation>;

/// Reads the current state of a resource, once per call
#[async_trait]
pub trait StateRefresh: Send + Sync {
    async fn refresh(&self, key: &ResourceKey) -> PollResult;
}

/// [`StateRefresh`] backed by [`Backend::describe`]
pub struct BackendRefresh {
    backend: Arc<dyn Backend>,
}

impl BackendRefresh {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StateRefresh for BackendRefresh {
    async fn refresh(&self, key: &ResourceKey) -> PollResult {
        match self.backend.describe(key).await {
            Ok(observed) => match self.backend.map_status(&observed.native_status) {
                Some(status) => Ok(Observation::Present {
                    value: observed.value,
                    status,
                }),
                None => Err(CloudError::UnmappedStatus {
                    key: key.clone(),
                    status: observed.native_status,
                }),
            },
            Err(e) if e.is_not_found() => {
                tracing::trace!("{} not found", key);
                Ok(Observation::Absent)
            }
            Err(e) => Err(e),
        }
    }
}
