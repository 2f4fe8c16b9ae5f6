//! Per-cluster workspace on the host
//!
//! Holds the cluster's SSH key pair and, for container clusters, the
//! directory shared into every node as `/dcos_install_tmp`. Its path is
//! stored in every resource's labels so a later process can find it again.

use crate::error::{E2eError, Result};
use crate::exec;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Host directory owned by one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create `<parent>/dcos-e2e-<cluster_id>` with a fresh SSH key pair.
    /// `parent` defaults to the system temp directory.
    pub async fn create(parent: Option<&Path>, cluster_id: &str) -> Result<Self> {
        let parent = parent
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let workspace = Self::open(parent.join(format!("dcos-e2e-{}", cluster_id)));

        workspace.prepare().await?;
        workspace.generate_key_pair().await?;
        info!(workspace = %workspace.root.display(), "Created cluster workspace");
        Ok(workspace)
    }

    /// Refer to an existing workspace, e.g. one named by a resource label
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Private key used to log in to every node
    pub fn ssh_key_path(&self) -> PathBuf {
        self.root.join("ssh").join("id_rsa")
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.root.join("ssh").join("id_rsa.pub")
    }

    pub async fn public_key(&self) -> Result<String> {
        let key = tokio::fs::read_to_string(self.public_key_path()).await?;
        Ok(key.trim().to_string())
    }

    /// Directory mounted into container nodes at `/dcos_install_tmp`
    pub fn install_tmp_dir(&self) -> PathBuf {
        self.root.join("dcos_install_tmp")
    }

    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("ssh")).await?;
        tokio::fs::create_dir_all(self.install_tmp_dir()).await?;
        Ok(())
    }

    async fn generate_key_pair(&self) -> Result<()> {
        let key = self.ssh_key_path();
        if tokio::fs::try_exists(&key).await? {
            return Ok(());
        }

        let mut command = Command::new("ssh-keygen");
        command
            .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
            .arg(&key);
        exec::execute(&mut command).await?;
        debug!("Generated SSH key pair at {}", key.display());
        Ok(())
    }

    /// Delete the workspace. A workspace that is already gone is fine.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                info!(workspace = %self.root.display(), "Removed cluster workspace");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(E2eError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path().join("dcos-e2e-abc"));
        workspace.prepare().await.unwrap();

        assert!(workspace.install_tmp_dir().is_dir());
        assert!(workspace.ssh_key_path().starts_with(workspace.path()));
        assert_eq!(
            workspace.public_key_path().file_name().unwrap(),
            "id_rsa.pub"
        );
    }

    #[tokio::test]
    async fn test_public_key_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path());
        workspace.prepare().await.unwrap();
        std::fs::write(workspace.public_key_path(), "ssh-rsa AAAA test\n").unwrap();

        assert_eq!(workspace.public_key().await.unwrap(), "ssh-rsa AAAA test");
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path().join("w"));
        workspace.prepare().await.unwrap();

        workspace.remove().await.unwrap();
        assert!(!workspace.path().exists());
        workspace.remove().await.unwrap();
    }
}
