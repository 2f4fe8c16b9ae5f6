//! Remote command execution
//!
//! A [`Transport`] runs a command on, or copies a file to, a single node.
//! Two implementations exist: [`SshTransport`] opens a fresh SSH connection
//! per call, and [`DockerExecTransport`] runs the command inside the node's
//! container on the local container runtime without a network hop.

pub mod docker_exec;
pub mod ssh;
pub mod stream;

pub use docker_exec::DockerExecTransport;
pub use ssh::SshTransport;
pub use stream::{run_streaming, LineSink, StreamKind, TracingSink};

use crate::error::{E2eError, Result};
use crate::node::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// What to do with a remote command's output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Output {
    /// Capture stdout and stderr silently
    #[default]
    Capture,
    /// Log each line as it arrives and capture it as well
    LogAndCapture,
    /// Inherit the caller's stdout and stderr
    NoCapture,
}

/// Channel used to reach a node, fixed when the node is constructed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeTransport {
    /// SSH to the node's public IP
    #[default]
    Ssh,
    /// `docker exec` into the container that owns the node's IP
    DockerExec,
}

impl std::fmt::Display for NodeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeTransport::Ssh => write!(f, "ssh"),
            NodeTransport::DockerExec => write!(f, "docker-exec"),
        }
    }
}

impl std::str::FromStr for NodeTransport {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ssh" => Ok(NodeTransport::Ssh),
            "docker-exec" => Ok(NodeTransport::DockerExec),
            other => Err(E2eError::InvalidConfig(format!(
                "unknown transport: {}",
                other
            ))),
        }
    }
}

/// Build the transport implementation for a transport kind
pub fn transport_for(kind: NodeTransport) -> Arc<dyn Transport> {
    match kind {
        NodeTransport::Ssh => Arc::new(SshTransport::default()),
        NodeTransport::DockerExec => Arc::new(DockerExecTransport::default()),
    }
}

/// A command to run on a node
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Command and arguments
    pub args: Vec<String>,
    /// User to run as; the node's default user when unset
    pub user: Option<String>,
    /// Environment variables exported before the command runs
    pub env: BTreeMap<String, String>,
    /// Pass `args` to the remote shell unquoted
    pub shell: bool,
    /// Allocate a pseudo-terminal
    pub tty: bool,
    /// Output handling
    pub output: Output,
    /// Give up on the command after this long
    pub timeout: Option<Duration>,
}

impl RunRequest {
    /// Create a request for the given command line
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Run a single shell snippet, e.g. `cd / && bash installer.sh`
    pub fn shell_snippet(snippet: impl Into<String>) -> Self {
        Self {
            args: vec![snippet.into()],
            shell: true,
            ..Default::default()
        }
    }

    /// Set the user to run as
    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Add several environment variables, later values winning
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Interpret arguments with the remote shell
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Allocate a pseudo-terminal
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Set output handling
    pub fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    /// Set a timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command as a single string for a POSIX shell on the node
    pub fn command_line(&self) -> String {
        let command = if self.shell {
            self.args.join(" ")
        } else {
            self.args
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" ")
        };

        if self.env.is_empty() {
            return command;
        }

        let exports = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("export {} && {}", exports, command)
    }
}

/// Quote a word for a POSIX shell, leaving plain words untouched
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`E2eError::RemoteCommandFailed`]
    pub fn into_result(self, node: &str, command: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(E2eError::RemoteCommandFailed {
            node: node.to_string(),
            command: command.to_string(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Handle to a remote command started with [`Transport::popen`]
#[derive(Debug)]
pub struct RemoteProcess {
    child: Child,
    node: String,
    command: String,
}

impl RemoteProcess {
    /// Local process ID of the transport client
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the command to finish and collect its output
    pub async fn wait_with_output(self) -> Result<CommandOutput> {
        let output = self.child.wait_with_output().await?;
        CommandOutput::from(output).into_result(&self.node, &self.command)
    }

    /// Kill the transport client, which ends the remote session
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

/// A channel for running commands on and copying files to one node
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Which kind of transport this is
    fn kind(&self) -> NodeTransport;

    /// Build the host-side command that runs `request` on `node`
    async fn remote_command(&self, node: &Node, request: &RunRequest) -> Result<Command>;

    /// Copy a local file to `remote` on the node, creating parent directories
    async fn send_file(&self, node: &Node, local: &Path, remote: &Path, user: &str) -> Result<()>;

    /// Copy `remote` on the node to a local path
    async fn download_file(&self, node: &Node, remote: &Path, local: &Path, user: &str)
        -> Result<()>;

    /// Run a command to completion. A non-zero exit is an error.
    async fn run(&self, node: &Node, request: &RunRequest) -> Result<CommandOutput> {
        let mut command = self.remote_command(node, request).await?;
        let rendered = request.command_line();
        let node_name = node.to_string();
        debug!(node = %node_name, transport = %self.kind(), "Running: {}", rendered);

        let execution = execute_remote(&mut command, &node_name, request.output);
        let output = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, execution)
                .await
                .map_err(|_| E2eError::CommandTimeout {
                    node: node_name.clone(),
                    command: rendered.clone(),
                    timeout,
                })??,
            None => execution.await?,
        };

        output.into_result(&node_name, &rendered)
    }

    /// Start a command without waiting for it
    async fn popen(&self, node: &Node, request: &RunRequest) -> Result<RemoteProcess> {
        let mut command = self.remote_command(node, request).await?;
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(RemoteProcess {
            child,
            node: node.to_string(),
            command: request.command_line(),
        })
    }
}

async fn execute_remote(
    command: &mut Command,
    node: &str,
    output: Output,
) -> std::io::Result<CommandOutput> {
    command.kill_on_drop(true);
    match output {
        Output::Capture => {
            let out = command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await?;
            Ok(out.into())
        }
        Output::LogAndCapture => {
            let mut sink = TracingSink::new(node);
            run_streaming(command, &mut sink).await
        }
        Output::NoCapture => {
            let status = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await?;
            Ok(CommandOutput {
                exit_code: status.code(),
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/opt/mesosphere/bin"), "/opt/mesosphere/bin");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_command_line_quotes_args() {
        let request = RunRequest::new(["echo", "hello world"]);
        assert_eq!(request.command_line(), "echo 'hello world'");
    }

    #[test]
    fn test_command_line_shell_mode() {
        let request = RunRequest::shell_snippet("cd / && ls | wc -l");
        assert_eq!(request.command_line(), "cd / && ls | wc -l");
    }

    #[test]
    fn test_command_line_exports_env() {
        let request = RunRequest::new(["env"])
            .env("B", "two words")
            .env("A", "1");
        assert_eq!(
            request.command_line(),
            "export A=1 B='two words' && env"
        );
    }

    #[test]
    fn test_into_result() {
        let ok = CommandOutput {
            exit_code: Some(0),
            stdout: "x".to_string(),
            stderr: String::new(),
        };
        assert!(ok.into_result("n", "c").is_ok());

        let failed = CommandOutput {
            exit_code: Some(127),
            stdout: String::new(),
            stderr: "sh: foo: not found\n".to_string(),
        };
        let err = failed.into_result("10.0.0.2", "foo").unwrap_err();
        assert_eq!(err.exit_code(), Some(127));
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("ssh".parse::<NodeTransport>().unwrap(), NodeTransport::Ssh);
        assert_eq!(
            "docker-exec".parse::<NodeTransport>().unwrap(),
            NodeTransport::DockerExec
        );
        assert!("telnet".parse::<NodeTransport>().is_err());
        assert_eq!(transport_for(NodeTransport::DockerExec).kind(), NodeTransport::DockerExec);
    }
}
