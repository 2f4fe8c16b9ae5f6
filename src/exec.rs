//! Host-side command execution
//!
//! Every backend driver shells out to a provider CLI (`docker`, `aws`,
//! `VBoxManage`, `vagrant`, `ssh-keygen`). These helpers run such a command,
//! check its exit status, and turn failures into [`E2eError::Execution`].

use crate::error::{E2eError, Result};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Render a command line for logs and error messages
pub fn command_to_string(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(" ")
}

/// Run a host command to completion and fail on a non-zero exit status
pub async fn execute(command: &mut Command) -> Result<Output> {
    let rendered = command_to_string(command);
    debug!("Running host command: {}", rendered);

    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| E2eError::Execution {
            command: rendered.clone(),
            message: format!("failed to start: {}", err),
        })?;

    if !output.status.success() {
        return Err(E2eError::Execution {
            command: rendered,
            message: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(output)
}

/// Run a host command and return its trimmed stdout
pub async fn execute_stdout(command: &mut Command) -> Result<String> {
    let output = execute(command).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_success() {
        let out = execute_stdout(Command::new("sh").arg("-c").arg("echo hello"))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_execute_failure_carries_stderr() {
        let err = execute(Command::new("sh").arg("-c").arg("echo nope >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            E2eError::Execution { command, message } => {
                assert!(command.starts_with("sh -c"));
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let err = execute(&mut Command::new("definitely-not-a-real-binary-e2e"))
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::Execution { .. }));
    }
}
