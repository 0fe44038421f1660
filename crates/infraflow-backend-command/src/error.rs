//! Command backend error types

use infraflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandBackendError {
    #[error("Provider executable not found: {0}")]
    ProgramNotFound(String),

    #[error("Provider command failed (exit {code}): {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("Provider command terminated by signal")]
    Terminated,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid provider output: {0}")]
    InvalidOutput(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommandBackendError>;

impl From<CommandBackendError> for CloudError {
    fn from(e: CommandBackendError) -> Self {
        match e {
            CommandBackendError::NotFound(key) => CloudError::ResourceNotFound(key),
            e @ (CommandBackendError::CommandFailed { .. } | CommandBackendError::Terminated) => {
                CloudError::CommandFailed(e.to_string())
            }
            e => CloudError::ApiError(e.to_string()),
        }
    }
}
