//! Command backend for InfraFlow
//!
//! Drives any provider through an external executable, so a new provider
//! needs no Rust code at all.
//!
//! # Protocol
//!
//! - `<program> <args..> describe <type> <name>` prints the resource as a
//!   JSON object. A dedicated exit code (4 by default) means not found.
//! - `<program> <args..> <create|update|delete> <type> <name>` applies a
//!   change; the operation's spec is written to stdin as JSON.
//!
//! # Example
//!
//! ```ignore
//! use infraflow_backend_command::{CommandBackend, CommandBackendConfig};
//! use infraflow_cloud::BackendRegistry;
//! use std::sync::Arc;
//!
//! let config = CommandBackendConfig::new("infraflow-aws");
//! let registry = BackendRegistry::new().with(Arc::new(CommandBackend::new("aws", config)));
//! ```

pub mod backend;
pub mod command;
pub mod error;

pub use backend::{
    CommandBackend, CommandBackendConfig, DEFAULT_NOT_FOUND_EXIT_CODE, DEFAULT_STATUS_FIELD,
};
pub use command::{CommandOutput, ProviderCommand};
pub use error::{CommandBackendError, Result};
