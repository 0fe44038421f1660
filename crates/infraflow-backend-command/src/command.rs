//! Provider executable wrapper
//!
//! Runs `<program> <args..> <verb> <type> <name>` and collects its output.

use crate::error::{CommandBackendError, Result};
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of one provider invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Provider executable plus its leading arguments
#[derive(Debug, Clone)]
pub struct ProviderCommand {
    program: String,
    args: Vec<String>,
}

impl ProviderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the program with `extra` appended, writing `stdin` if given.
    ///
    /// The child is killed if the returned future is dropped.
    pub async fn run(&self, extra: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.args(extra);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(
            "Running: {} {} {}",
            self.program,
            self.args.join(" "),
            extra.join(" ")
        );

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => CommandBackendError::ProgramNotFound(self.program.clone()),
            _ => CommandBackendError::IoError(e),
        })?;

        // Feed stdin while draining stdout/stderr so neither side blocks on a full pipe
        let pipe = child.stdin.take();
        let feed = async move {
            let (Some(input), Some(mut pipe)) = (stdin, pipe) else {
                return Ok(());
            };
            match pipe.write_all(input).await {
                // The program may exit without reading its input
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        fed?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Like [`ProviderCommand::run`], failing on any non-zero exit
    pub async fn run_checked(&self, extra: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        let output = self.run(extra, stdin).await?;
        match output.code {
            Some(0) => Ok(output.stdout),
            Some(code) => Err(CommandBackendError::CommandFailed {
                code,
                stderr: output.stderr.trim().to_string(),
            }),
            None => Err(CommandBackendError::Terminated),
        }
    }
}
