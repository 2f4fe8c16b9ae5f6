//! Test double for nodes
//!
//! [`ScriptedTransport`] runs every "remote" command as a local `sh` that
//! prints canned output, and records what it was asked to do.

use crate::error::Result;
use crate::node::Node;
use crate::transport::{NodeTransport, RunRequest, Transport};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;

#[derive(Debug, Clone)]
struct Response {
    pattern: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// A file handed to [`Transport::send_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub node: String,
    pub remote: PathBuf,
    pub contents: String,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Vec<Response>,
    commands: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<SentFile>>,
}

impl ScriptedTransport {
    /// Answer commands containing `pattern`. Earlier rules win; unmatched
    /// commands succeed silently.
    pub fn respond(mut self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.responses.push(Response {
            pattern: pattern.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
        self
    }

    /// `(node, command line)` for every command run so far
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    /// Command lines run on one node
    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(n, _)| n == node)
            .map(|(_, command)| command)
            .collect()
    }

    pub fn sent_files(&self) -> Vec<SentFile> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> NodeTransport {
        NodeTransport::Ssh
    }

    async fn remote_command(&self, node: &Node, request: &RunRequest) -> Result<Command> {
        let line = request.command_line();
        self.commands
            .lock()
            .unwrap()
            .push((node.public_ip().to_string(), line.clone()));

        let response = self
            .responses
            .iter()
            .find(|response| line.contains(&response.pattern));
        let (exit_code, stdout, stderr) = match response {
            Some(r) => (r.exit_code, r.stdout.as_str(), r.stderr.as_str()),
            None => (0, "", ""),
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(format!("printf '%s' \"$0\"; printf '%s' \"$1\" >&2; exit {}", exit_code))
            .arg(stdout)
            .arg(stderr);
        Ok(command)
    }

    async fn send_file(&self, node: &Node, local: &Path, remote: &Path, _user: &str) -> Result<()> {
        let contents = tokio::fs::read_to_string(local).await.unwrap_or_default();
        self.sent.lock().unwrap().push(SentFile {
            node: node.public_ip().to_string(),
            remote: remote.to_path_buf(),
            contents,
        });
        Ok(())
    }

    async fn download_file(
        &self,
        _node: &Node,
        _remote: &Path,
        local: &Path,
        _user: &str,
    ) -> Result<()> {
        tokio::fs::write(local, b"").await?;
        Ok(())
    }
}

/// A root-user node backed by `transport`
pub fn scripted_node(ip: &str, transport: &Arc<ScriptedTransport>) -> Node {
    Node::with_transport(
        ip.parse().unwrap(),
        ip.parse().unwrap(),
        PathBuf::from("/tmp/id_rsa"),
        "root",
        transport.clone(),
    )
}

/// Behaves like a real installer: chatty on the first run in a directory,
/// plain JSON afterwards.
const FAKE_INSTALLER: &str = r#"#!/bin/sh
if [ ! -f .extracted ]; then
    echo "Extracting image from this script and loading into docker daemon"
    touch .extracted
fi
echo '{"variant": "VARIANT", "version": "1.12.0-dev"}'
"#;

/// Write a fake `dcos_generate_config.sh` reporting `variant` ("" or "ee")
pub fn write_fake_installer(dir: &Path, variant: &str) -> PathBuf {
    let path = dir.join("dcos_generate_config.sh");
    std::fs::write(&path, FAKE_INSTALLER.replace("VARIANT", variant)).unwrap();
    path
}

/// A stand-in `docker` binary with one running container, `c0ffee` on
/// 172.17.0.2. Every invocation is appended to a log.
pub struct FakeDocker {
    pub binary: PathBuf,
    log: PathBuf,
}

impl FakeDocker {
    /// Arguments of every invocation so far, one line each
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

pub fn fake_docker(dir: &Path) -> FakeDocker {
    use std::os::unix::fs::PermissionsExt;

    let binary = dir.join("docker");
    let log = dir.join("docker-calls.log");
    let script = format!(
        r#"#!/bin/sh
echo "$*" >> '{}'
case "$1" in
    ps) echo c0ffee ;;
    inspect) echo '[{{"Id": "c0ffee", "NetworkSettings": {{"IPAddress": "172.17.0.2"}}}}]' ;;
esac
"#,
        log.display()
    );
    std::fs::write(&binary, script).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    FakeDocker { binary, log }
}
