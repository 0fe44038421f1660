//! Provisioning backend trait definition

use crate::action::Operation;
use crate::error::{CloudError, Result};
use crate::key::{ResourceKey, StatusToken};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Provisioning backend abstraction trait
///
/// Every provider integration (a cloud SDK, a Terraform-like plugin
/// executable, an in-memory fake) implements this trait. The orchestrator
/// never talks to a provider any other way.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the provider name used in resource keys (e.g., "aws")
    fn name(&self) -> &str;

    /// Read the current state of one resource.
    ///
    /// A missing resource must be reported as [`CloudError::ResourceNotFound`]
    /// so it can be told apart from transport failures.
    async fn describe(&self, key: &ResourceKey) -> Result<Observed>;

    /// Issue the mutating call (create, update or delete) for an operation.
    /// Completion is observed afterwards through [`Backend::describe`].
    async fn submit(&self, operation: &Operation) -> Result<()>;

    /// Map a native status onto a normalized token, or `None` when the
    /// status is not one this backend knows.
    fn map_status(&self, native: &str) -> Option<StatusToken> {
        if native.trim().is_empty() {
            None
        } else {
            Some(StatusToken::new(native))
        }
    }
}

/// Raw result of one describe call
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    /// Provider-native lifecycle status
    pub native_status: String,

    /// Provider-specific resource attributes (id, addresses, ...)
    pub value: serde_json::Value,
}

impl Observed {
    pub fn new(native_status: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            native_status: native_status.into(),
            value,
        }
    }
}

/// Registered backends indexed by provider name
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name, replacing any previous one
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(provider)
            .cloned()
            .ok_or_else(|| CloudError::ProviderNotFound(provider.to_string()))
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.backends.contains_key(provider)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}
