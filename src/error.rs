//! Error types shared by every k3sbox component.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for k3sbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The docker client could not be spawned or the daemon did not answer.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// No cluster container is discoverable.
    #[error("cluster container not found: {0}")]
    ContainerNotFound(String),

    /// `up` found an existing cluster container and the policy forbids reuse.
    #[error("cluster container {0} already exists")]
    ContainerExists(String),

    #[error("timed out after {timeout:?} waiting for {description}")]
    Timeout {
        description: String,
        timeout: Duration,
    },

    /// A command exited non-zero. `output` holds the captured lines.
    #[error("command `{command}` failed with exit code {}", exit_code_label(.exit_code))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        output: Vec<String>,
    },

    #[error("failed to copy {source_path} to {destination}: {reason}")]
    TransferFailed {
        source_path: String,
        destination: String,
        reason: String,
    },

    /// Aggregate signal only; individual task errors were logged.
    #[error("{failed} of {total} image imports failed")]
    ProvisioningFailed { failed: usize, total: usize },

    #[error("{failed} of {total} rollout restarts failed")]
    RestartFailed { failed: usize, total: usize },

    #[error("invalid resource specifier '{0}', expected kind[/namespace]/name")]
    InvalidResourceSpecifier(String),

    #[error("invalid configuration in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed engine or cluster response: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a wait loop should keep polling after seeing this error.
    ///
    /// Configuration mistakes never heal by themselves, so they abort the
    /// wait instead of burning the whole timeout.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidResourceSpecifier(_) | Error::Config { .. }
        )
    }

    /// Captured output attached to the error, if any.
    pub fn output(&self) -> &[String] {
        match self {
            Error::CommandFailed { output, .. } => output,
            _ => &[],
        }
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}
