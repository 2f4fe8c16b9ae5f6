//! Error types for dcos-e2e

use crate::readiness::ReadinessState;
use std::time::Duration;
use thiserror::Error;

/// Result type for dcos-e2e operations
pub type Result<T> = std::result::Result<T, E2eError>;

/// dcos-e2e error types
#[derive(Error, Debug)]
pub enum E2eError {
    /// A command run on a cluster node exited non-zero
    #[error(
        "Command [{command}] on {node} failed with exit code {}: {}",
        display_exit_code(.exit_code),
        .stderr.trim()
    )]
    RemoteCommandFailed {
        node: String,
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Command [{command}] on {node} did not finish within {timeout:?}")]
    CommandTimeout {
        node: String,
        command: String,
        timeout: Duration,
    },

    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    #[error("Installer introspection failed: {0}")]
    InstallerIntrospectionFailed(String),

    #[error("Timed out after {elapsed:?} while {state}")]
    ReadinessTimeout {
        state: ReadinessState,
        elapsed: Duration,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A command run on the host (docker, aws, VBoxManage, ssh-keygen) failed
    #[error("Host command [{command}] failed: {message}")]
    Execution { command: String, message: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl E2eError {
    /// Whether this error means "not there yet" rather than "broken"
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            E2eError::ReadinessTimeout { .. } | E2eError::CommandTimeout { .. }
        )
    }

    /// Exit code of a failed remote command, if this is one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            E2eError::RemoteCommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}
