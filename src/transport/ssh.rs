//! SSH transport
//!
//! Shells out to the OpenSSH client. Each call opens a new connection using
//! the node's key. Host keys are not verified: cluster nodes are short-lived
//! test machines that get a new host key every time they are created.

use super::{RunRequest, Transport};
use crate::error::Result;
use crate::exec;
use crate::node::Node;
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;
use tokio::process::Command;

/// Options shared by `ssh` and `scp`
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "PreferredAuthentications=publickey",
    "-o",
    "BatchMode=yes",
    "-o",
    "ServerAliveInterval=30",
    "-o",
    "ConnectionAttempts=3",
];

/// Run commands over SSH
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_binary: String,
    scp_binary: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
        }
    }
}

impl SshTransport {
    fn base_command(&self, program: &str, node: &Node) -> Command {
        let mut command = Command::new(program);
        command.args(SSH_OPTIONS).arg("-i").arg(node.ssh_key_path());
        command
    }

    async fn ensure_parent(&self, node: &Node, remote: &Path, user: &str) -> Result<()> {
        if let Some(parent) = remote.parent().filter(|p| !p.as_os_str().is_empty()) {
            let parent = parent.to_string_lossy().into_owned();
            let request = RunRequest::new(["mkdir", "-p", parent.as_str()]).user(user);
            self.run(node, &request).await?;
        }
        Ok(())
    }
}

/// `user@host:path` for scp, bracketing IPv6 addresses
fn scp_target(user: &str, ip: IpAddr, path: &Path) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}@{}:{}", user, v4, path.display()),
        IpAddr::V6(v6) => format!("{}@[{}]:{}", user, v6, path.display()),
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> super::NodeTransport {
        super::NodeTransport::Ssh
    }

    async fn remote_command(&self, node: &Node, request: &RunRequest) -> Result<Command> {
        let user = request
            .user
            .clone()
            .unwrap_or_else(|| node.default_user().to_string());

        let mut command = self.base_command(&self.ssh_binary, node);
        command.arg("-l").arg(user);
        if request.tty {
            command.arg("-tt");
        }
        command
            .arg(node.public_ip().to_string())
            .arg("--")
            .arg(request.command_line());
        Ok(command)
    }

    async fn send_file(&self, node: &Node, local: &Path, remote: &Path, user: &str) -> Result<()> {
        self.ensure_parent(node, remote, user).await?;

        let mut command = self.base_command(&self.scp_binary, node);
        command
            .arg(local)
            .arg(scp_target(user, node.public_ip(), remote));
        exec::execute(&mut command).await?;
        Ok(())
    }

    async fn download_file(
        &self,
        node: &Node,
        remote: &Path,
        local: &Path,
        user: &str,
    ) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = self.base_command(&self.scp_binary, node);
        command
            .arg(scp_target(user, node.public_ip(), remote))
            .arg(local);
        exec::execute(&mut command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NodeTransport;
    use std::path::PathBuf;

    fn node() -> Node {
        Node::new(
            "10.0.0.5".parse().unwrap(),
            "172.16.0.5".parse().unwrap(),
            PathBuf::from("/tmp/workspace/ssh/id_rsa"),
            "centos",
            NodeTransport::Ssh,
        )
    }

    #[tokio::test]
    async fn test_remote_command_shape() {
        let transport = SshTransport::default();
        let request = RunRequest::new(["echo", "a b"]).user("root").tty(true);
        let command = transport.remote_command(&node(), &request).await.unwrap();
        let rendered = exec::command_to_string(&command);

        assert!(rendered.starts_with("ssh -o StrictHostKeyChecking=no"));
        assert!(rendered.contains("-i /tmp/workspace/ssh/id_rsa"));
        assert!(rendered.contains("-l root -tt 10.0.0.5 -- echo 'a b'"));
    }

    #[tokio::test]
    async fn test_default_user_is_used() {
        let transport = SshTransport::default();
        let command = transport
            .remote_command(&node(), &RunRequest::new(["true"]))
            .await
            .unwrap();
        assert!(exec::command_to_string(&command).contains("-l centos 10.0.0.5"));
    }

    #[test]
    fn test_scp_target() {
        let path = Path::new("/genconf/config.yaml");
        assert_eq!(
            scp_target("root", "10.0.0.1".parse().unwrap(), path),
            "root@10.0.0.1:/genconf/config.yaml"
        );
        assert_eq!(
            scp_target("root", "fd00::1".parse().unwrap(), path),
            "root@[fd00::1]:/genconf/config.yaml"
        );
    }
}
