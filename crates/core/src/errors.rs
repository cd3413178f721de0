//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (runtime, image build, configuration) that are wrapped in the main
//! [`HarnessError`] enum. Command failures carry everything needed to diagnose
//! them without re-running: the command, the container and image, the
//! expected and actual exit codes, and the captured output.

use crate::command::ExitCodes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Container runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime binary is not installed or not accessible
    #[error("Container runtime '{runtime}' is not installed or not accessible")]
    NotInstalled { runtime: String },

    /// Runtime CLI command error
    #[error("Runtime CLI error: {0}")]
    CLIError(String),

    /// Container not found
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// Background task running a runtime command could not be joined
    #[error("Runtime task failed: {0}")]
    Join(String),
}

/// Derived image build errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// The runtime rejected the build
    #[error("Failed to build image derived from {base}: {message}")]
    Failed { base: String, message: String },

    /// Build context could not be prepared
    #[error("Failed to prepare build context at {path}")]
    Context {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Overlay step that cannot be rendered
    #[error("Invalid overlay step: {message}")]
    InvalidStep { message: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
}

/// Diagnostic context of a command that did not finish as expected
#[derive(Debug, Clone)]
pub struct CommandFailure {
    /// Rendered command
    pub command: String,
    /// Container the command ran in
    pub container_id: String,
    /// Image the container was started from
    pub image: String,
    /// Acceptable exit codes
    pub expected: ExitCodes,
    /// Actual exit code, `None` when the command was cut off by a timeout
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actual = match self.exit_code {
            Some(code) => code.to_string(),
            None => "none".to_string(),
        };
        write!(
            f,
            "command `{}` in container {} (image {}): exit code {}, expected one of {}",
            self.command,
            short_id(&self.container_id),
            self.image,
            actual,
            self.expected
        )?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, "\nstderr:\n{}", stderr)?;
        }
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Command exited with a code outside the acceptable set
    #[error("Unexpected exit code: {0}")]
    UnexpectedExitCode(Box<CommandFailure>),

    /// Command did not complete within the allotted time
    #[error("Timed out after {timeout:?}: {failure}")]
    Timeout {
        failure: Box<CommandFailure>,
        timeout: Duration,
    },

    /// Overlay build failed before any test logic ran
    #[error("Build failure: {0}")]
    Build(#[from] BuildError),

    /// The container runtime could not serve the request
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(#[from] RuntimeError),

    /// A predicate could not be evaluated (distinct from evaluating to false)
    #[error("Predicate `{predicate}` could not be evaluated: {message}")]
    Probe { predicate: String, message: String },

    /// Operation issued against a container that is not ready
    #[error("Cannot {operation} container {container}: container is {state}")]
    InvalidState {
        container: String,
        state: String,
        operation: String,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HarnessError {
    /// True for failures caused by a command's exit status, timeouts included.
    pub fn is_exit_failure(&self) -> bool {
        matches!(self, Self::UnexpectedExitCode(_) | Self::Timeout { .. })
    }

    /// True only for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Command diagnostics when the error came from a command execution.
    pub fn command_failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::UnexpectedExitCode(failure) => Some(failure),
            Self::Timeout { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Convenience type alias for Results with HarnessError
pub type Result<T> = std::result::Result<T, HarnessError>;
