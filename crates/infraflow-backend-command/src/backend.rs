//! [`Backend`] implementation over a provider executable

use crate::command::ProviderCommand;
use crate::error::{CommandBackendError, Result};
use async_trait::async_trait;
use infraflow_cloud::{Backend, Observed, Operation, ResourceKey, StatusToken};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_STATUS_FIELD: &str = "status";
pub const DEFAULT_NOT_FOUND_EXIT_CODE: i32 = 4;

fn default_status_field() -> String {
    DEFAULT_STATUS_FIELD.to_string()
}

fn default_not_found_exit_code() -> i32 {
    DEFAULT_NOT_FOUND_EXIT_CODE
}

/// How to drive one provider executable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBackendConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Top-level field, or a JSON pointer such as `/state/name`, holding
    /// the native status in describe output
    #[serde(default = "default_status_field")]
    pub status_field: String,

    #[serde(default = "default_not_found_exit_code")]
    pub not_found_exit_code: i32,

    /// Native status -> normalized token. When set, natives missing from
    /// the map are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_map: Option<BTreeMap<String, String>>,
}

impl CommandBackendConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            status_field: default_status_field(),
            not_found_exit_code: DEFAULT_NOT_FOUND_EXIT_CODE,
            status_map: None,
        }
    }
}

/// Provider backend that shells out to an executable
pub struct CommandBackend {
    name: String,
    command: ProviderCommand,
    status_field: String,
    not_found_exit_code: i32,
    status_map: Option<BTreeMap<String, StatusToken>>,
}

impl CommandBackend {
    pub fn new(name: impl Into<String>, config: CommandBackendConfig) -> Self {
        let status_map = config.status_map.map(|map| {
            map.into_iter()
                .map(|(native, token)| (native.trim().to_uppercase(), StatusToken::new(token)))
                .collect()
        });
        Self {
            name: name.into(),
            command: ProviderCommand::new(config.program).with_args(config.args),
            status_field: config.status_field,
            not_found_exit_code: config.not_found_exit_code,
            status_map,
        }
    }

    /// Run `describe <type> <name>` and parse its JSON object
    pub async fn describe_raw(&self, key: &ResourceKey) -> Result<serde_json::Value> {
        let output = self
            .command
            .run(&["describe", key.resource_type.as_str(), key.name.as_str()], None)
            .await?;

        match output.code {
            Some(0) => {}
            Some(code) if code == self.not_found_exit_code => {
                return Err(CommandBackendError::NotFound(key.to_string()));
            }
            Some(code) => {
                return Err(CommandBackendError::CommandFailed {
                    code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            None => return Err(CommandBackendError::Terminated),
        }

        let value: serde_json::Value = serde_json::from_str(output.stdout.trim())?;
        if !value.is_object() {
            return Err(CommandBackendError::InvalidOutput(format!(
                "describe {} did not return a JSON object",
                key
            )));
        }
        Ok(value)
    }

    /// Extract the native status from describe output
    pub fn native_status(&self, value: &serde_json::Value) -> Result<String> {
        let field = if self.status_field.starts_with('/') {
            value.pointer(&self.status_field)
        } else {
            value.get(&self.status_field)
        };
        field
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CommandBackendError::InvalidOutput(format!(
                    "missing string field '{}'",
                    self.status_field
                ))
            })
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn describe(&self, key: &ResourceKey) -> infraflow_cloud::Result<Observed> {
        let value = self.describe_raw(key).await?;
        let native = self.native_status(&value)?;
        tracing::trace!("{} reports {}", key, native);
        Ok(Observed::new(native, value))
    }

    async fn submit(&self, operation: &Operation) -> infraflow_cloud::Result<()> {
        let key = &operation.key;
        let verb = operation.action.to_string();
        let input = serde_json::to_vec(&operation.spec).map_err(CommandBackendError::from)?;

        self.command
            .run_checked(
                &[verb.as_str(), key.resource_type.as_str(), key.name.as_str()],
                Some(&input),
            )
            .await?;
        tracing::debug!("{} accepted {} {}", self.name, verb, key);
        Ok(())
    }

    fn map_status(&self, native: &str) -> Option<StatusToken> {
        let native = native.trim();
        if native.is_empty() {
            return None;
        }
        match &self.status_map {
            Some(map) => map.get(&native.to_uppercase()).cloned(),
            None => Some(StatusToken::new(native)),
        }
    }
}

impl std::fmt::Debug for CommandBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBackend")
            .field("name", &self.name)
            .field("program", &self.command.program())
            .finish()
    }
}
