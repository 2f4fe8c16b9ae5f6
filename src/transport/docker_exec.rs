//! `docker exec` transport
//!
//! Runs commands inside the container that owns a node's IP address. Used
//! where the host cannot route to container IPs, e.g. Docker for Mac.

use super::{NodeTransport, RunRequest, Transport};
use crate::backend::docker::cli::DockerCli;
use crate::error::Result;
use crate::exec;
use crate::node::Node;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Run commands through the local container runtime
#[derive(Debug, Clone, Default)]
pub struct DockerExecTransport {
    docker: DockerCli,
}

impl DockerExecTransport {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }

    async fn container_id(&self, node: &Node) -> Result<String> {
        Ok(self.docker.container_for_ip(node.public_ip()).await?.id)
    }
}

#[async_trait]
impl Transport for DockerExecTransport {
    fn kind(&self) -> NodeTransport {
        NodeTransport::DockerExec
    }

    async fn remote_command(&self, node: &Node, request: &RunRequest) -> Result<Command> {
        let container = self.container_id(node).await?;
        let user = request
            .user
            .clone()
            .unwrap_or_else(|| node.default_user().to_string());

        let mut command = self.docker.command();
        command.arg("exec");
        if request.tty {
            command.arg("--tty");
        }
        command
            .arg("--user")
            .arg(user)
            .arg(container)
            .args(["/bin/sh", "-c"])
            .arg(request.command_line());
        Ok(command)
    }

    async fn send_file(&self, node: &Node, local: &Path, remote: &Path, user: &str) -> Result<()> {
        let container = self.container_id(node).await?;

        if let Some(parent) = remote.parent().filter(|p| !p.as_os_str().is_empty()) {
            let parent = parent.to_string_lossy().into_owned();
            self.run(node, &RunRequest::new(["mkdir", "-p", parent.as_str()]).user("root"))
                .await?;
        }

        let mut command = self.docker.command();
        command
            .arg("cp")
            .arg(local)
            .arg(format!("{}:{}", container, remote.display()));
        exec::execute(&mut command).await?;

        if user != "root" {
            let remote = remote.to_string_lossy().into_owned();
            self.run(node, &RunRequest::new(["chown", user, remote.as_str()]).user("root"))
                .await?;
        }
        Ok(())
    }

    async fn download_file(
        &self,
        node: &Node,
        remote: &Path,
        local: &Path,
        _user: &str,
    ) -> Result<()> {
        let container = self.container_id(node).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = self.docker.command();
        command
            .arg("cp")
            .arg(format!("{}:{}", container, remote.display()))
            .arg(local);
        exec::execute(&mut command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_docker, FakeDocker};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn node(fake: &FakeDocker) -> Node {
        let docker = DockerCli::new(&fake.binary.to_string_lossy());
        Node::with_transport(
            "172.17.0.2".parse().unwrap(),
            "172.17.0.2".parse().unwrap(),
            PathBuf::from("/k"),
            "root",
            Arc::new(DockerExecTransport::new(docker)),
        )
    }

    #[tokio::test]
    async fn test_remote_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_docker(dir.path());
        let transport = DockerExecTransport::new(DockerCli::new(&fake.binary.to_string_lossy()));

        let request = RunRequest::new(["echo", "a b"]).user("nobody").tty(true);
        let command = transport.remote_command(&node(&fake), &request).await.unwrap();

        assert_eq!(
            exec::command_to_string(&command),
            format!(
                "{} exec --tty --user nobody c0ffee /bin/sh -c echo 'a b'",
                fake.binary.display()
            )
        );
    }

    #[tokio::test]
    async fn test_unknown_ip_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_docker(dir.path());
        let transport = DockerExecTransport::new(DockerCli::new(&fake.binary.to_string_lossy()));
        let stranger = Node::new(
            "172.17.0.9".parse().unwrap(),
            "172.17.0.9".parse().unwrap(),
            PathBuf::from("/k"),
            "root",
            NodeTransport::DockerExec,
        );

        let err = transport
            .remote_command(&stranger, &RunRequest::new(["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::E2eError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_file_as_other_user_changes_owner() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_docker(dir.path());
        let local = dir.path().join("config.yaml");
        std::fs::write(&local, "cluster_name: e2e\n").unwrap();

        node(&fake)
            .send_file_as(&local, Path::new("/genconf/config.yaml"), "centos")
            .await
            .unwrap();

        let calls = fake.calls();
        let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
        let mkdir = position("exec --user root c0ffee /bin/sh -c mkdir -p /genconf");
        let copy = position(&format!("cp {} c0ffee:/genconf/config.yaml", local.display()));
        let chown =
            position("exec --user root c0ffee /bin/sh -c chown centos /genconf/config.yaml");
        assert!(mkdir < copy);
        assert!(copy < chown);
    }

    #[tokio::test]
    async fn test_send_file_as_root_keeps_owner() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_docker(dir.path());
        let local = dir.path().join("ip-detect");
        std::fs::write(&local, "#!/bin/sh\n").unwrap();

        node(&fake)
            .send_file_as(&local, Path::new("/genconf/ip-detect"), "root")
            .await
            .unwrap();

        assert!(!fake.calls().iter().any(|call| call.contains("chown")));
    }
}
