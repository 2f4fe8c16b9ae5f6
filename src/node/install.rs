//! Per-node DC/OS installation and upgrade
//!
//! Installing is a fixed sequence with no rollback:
//! 1. put the installer at `/dcos_install_tmp` (unless the backend already did)
//! 2. stage `config.yaml`, `ip-detect` and extra files into `/genconf`
//! 3. run the installer in `--genconf` mode to render the install bundle
//! 4. run `dcos_install.sh` for the node's role
//!
//! A failing step leaves the node partially configured and returns the
//! failed command's error.

use super::{Node, Role};
use crate::error::{E2eError, Result};
use crate::transport::{shell_quote, CommandOutput, Output, RunRequest};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

/// Directory the installer is placed in on each node
pub const INSTALL_TMP_DIR: &str = "/dcos_install_tmp";
/// Where the installer lives on a node
pub const INSTALLER_REMOTE_PATH: &str = "/dcos_install_tmp/dcos_generate_config.sh";
/// Genconf staging directory on each node
pub const GENCONF_DIR: &str = "/genconf";

/// IP detection script for nodes whose primary interface is `eth0`
pub const DEFAULT_IP_DETECT: &str = r#"#!/usr/bin/env bash
set -o nounset -o errexit
export PATH=/usr/sbin:/usr/bin:$PATH
echo $(ip addr show eth0 | grep -Eo '[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}' | head -1)
"#;

/// Where a node gets its installer from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerLocation {
    /// A file on the host, copied to the node
    Local(PathBuf),
    /// A URL the node downloads
    Url(String),
    /// Already present on the node at this path
    Staged(PathBuf),
}

/// Files staged into `/genconf` before the installer runs
#[derive(Debug, Clone)]
pub struct GenconfFiles {
    ip_detect: String,
    files: Vec<(PathBuf, PathBuf)>,
}

impl Default for GenconfFiles {
    fn default() -> Self {
        Self::new(DEFAULT_IP_DETECT)
    }
}

impl GenconfFiles {
    /// Stage the given IP detection script
    pub fn new(ip_detect: &str) -> Self {
        Self {
            ip_detect: ip_detect.to_string(),
            files: Vec::new(),
        }
    }

    /// Stage a host file or directory at `destination`, relative to `/genconf`
    pub fn with_file(mut self, local: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        self.files.push((local.into(), destination.into()));
        self
    }

    /// Stage several files at once
    pub fn with_files(mut self, files: &[(PathBuf, PathBuf)]) -> Self {
        self.files.extend(files.iter().cloned());
        self
    }

    pub fn ip_detect(&self) -> &str {
        &self.ip_detect
    }

    /// Every (host file, node path) pair, with directories expanded
    pub fn expand(&self) -> Result<Vec<(PathBuf, PathBuf)>> {
        let genconf = Path::new(GENCONF_DIR);
        let mut expanded = Vec::new();

        for (local, destination) in &self.files {
            let target = genconf.join(destination);
            if !local.is_dir() {
                expanded.push((local.clone(), target));
                continue;
            }

            for entry in WalkDir::new(local).sort_by_file_name() {
                let entry = entry.map_err(|e| E2eError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(local)
                    .map_err(|e| E2eError::Internal(e.to_string()))?;
                expanded.push((entry.path().to_path_buf(), target.join(relative)));
            }
        }

        Ok(expanded)
    }
}

/// Make a request run with root privileges on `node`
pub(crate) fn as_root(node: &Node, request: RunRequest) -> RunRequest {
    if node.default_user() == "root" || request.user.as_deref() == Some("root") {
        return request;
    }

    let wrapped = format!("sudo sh -c {}", shell_quote(&request.command_line()));
    RunRequest {
        args: vec![wrapped],
        shell: true,
        env: Default::default(),
        ..request
    }
}

/// Copy a host file to `remote`, going through `/tmp` and `sudo` when the
/// node's user cannot write there directly
async fn put_file(node: &Node, local: &Path, remote: &Path) -> Result<()> {
    debug!(node = %node, "Sending {} to {}", local.display(), remote.display());

    if node.default_user() == "root" {
        return node.send_file(local, remote).await;
    }

    let staging = PathBuf::from(format!("/tmp/dcos-e2e-{}", Uuid::new_v4().simple()));
    node.send_file(local, &staging).await?;

    let parent = remote
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    let snippet = format!(
        "mkdir -p {} && mv {} {}",
        shell_quote(&parent),
        shell_quote(&staging.to_string_lossy()),
        shell_quote(&remote.to_string_lossy())
    );
    node.run(&as_root(node, RunRequest::shell_snippet(snippet)))
        .await?;
    Ok(())
}

/// Write `contents` to `remote` on the node
async fn put_contents(node: &Node, contents: &str, remote: &Path) -> Result<()> {
    let local = std::env::temp_dir().join(format!("dcos-e2e-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&local, contents).await?;
    let result = put_file(node, &local, remote).await;
    let _ = tokio::fs::remove_file(&local).await;
    result
}

async fn stage_installer(node: &Node, installer: &InstallerLocation) -> Result<PathBuf> {
    let remote = PathBuf::from(INSTALLER_REMOTE_PATH);
    match installer {
        InstallerLocation::Local(path) => {
            put_file(node, path, &remote).await?;
            Ok(remote)
        }
        InstallerLocation::Url(url) => {
            let snippet = format!(
                "mkdir -p {} && curl --fail --location --silent --show-error --output {} {}",
                INSTALL_TMP_DIR,
                INSTALLER_REMOTE_PATH,
                shell_quote(url)
            );
            node.run(&as_root(node, RunRequest::shell_snippet(snippet)))
                .await?;
            Ok(remote)
        }
        InstallerLocation::Staged(path) => Ok(path.clone()),
    }
}

async fn stage_genconf(
    node: &Node,
    config: &serde_yaml::Mapping,
    genconf: &GenconfFiles,
) -> Result<()> {
    let genconf_dir = Path::new(GENCONF_DIR);
    put_contents(node, &crate::config::to_yaml(config)?, &genconf_dir.join("config.yaml")).await?;
    put_contents(node, genconf.ip_detect(), &genconf_dir.join("ip-detect")).await?;

    for (local, remote) in genconf.expand()? {
        put_file(node, &local, &remote).await?;
    }
    Ok(())
}

async fn run_installer(
    node: &Node,
    installer: &Path,
    args: &str,
    output: Output,
) -> Result<CommandOutput> {
    let snippet = format!(
        "cd / && bash {} {}",
        shell_quote(&installer.to_string_lossy()),
        args
    );
    node.run(&as_root(node, RunRequest::shell_snippet(snippet)).output(output))
        .await
}

pub(crate) async fn install(
    node: &Node,
    installer: &InstallerLocation,
    config: &serde_yaml::Mapping,
    role: Role,
    genconf: &GenconfFiles,
    output: Output,
) -> Result<()> {
    info!(node = %node, role = %role, "Installing DC/OS");

    let installer_path = stage_installer(node, installer).await?;
    stage_genconf(node, config, genconf).await?;
    run_installer(node, &installer_path, "--offline -v --genconf", output).await?;

    let install_script = format!("{}/serve/dcos_install.sh", GENCONF_DIR);
    let request = RunRequest::new([
        "bash",
        install_script.as_str(),
        "--no-block-dcos-setup",
        role.install_role(),
    ])
    .output(output);
    node.run(&as_root(node, request)).await?;

    info!(node = %node, role = %role, "DC/OS install script finished");
    Ok(())
}

pub(crate) async fn upgrade(
    node: &Node,
    installer: &InstallerLocation,
    config: &serde_yaml::Mapping,
    role: Role,
    genconf: &GenconfFiles,
    output: Output,
) -> Result<()> {
    let current = node.build_info().await?;
    info!(
        node = %node,
        role = %role,
        from = %current.version,
        "Upgrading DC/OS"
    );

    let installer_path = stage_installer(node, installer).await?;
    stage_genconf(node, config, genconf).await?;

    // The script location is only known from the installer's output.
    let capture = match output {
        Output::NoCapture => Output::LogAndCapture,
        other => other,
    };
    let generated = run_installer(
        node,
        &installer_path,
        &format!(
            "--offline -v --generate-node-upgrade-script {}",
            shell_quote(&current.version)
        ),
        capture,
    )
    .await?;

    let script = upgrade_script_path(&generated.stdout)?;
    let script = script.to_string_lossy().into_owned();
    node.run(&as_root(node, RunRequest::new(["bash", script.as_str()]).output(output)))
        .await?;

    info!(node = %node, role = %role, "DC/OS node upgrade script finished");
    Ok(())
}

/// Find the generated node upgrade script in the installer's output
fn upgrade_script_path(installer_output: &str) -> Result<PathBuf> {
    let pattern = Regex::new(r"(upgrade/[^\s'\x22]+/dcos_node_upgrade\.sh)")
        .map_err(|e| E2eError::Internal(e.to_string()))?;

    pattern
        .captures_iter(installer_output)
        .last()
        .and_then(|captures| captures.get(1))
        .map(|m| Path::new(GENCONF_DIR).join("serve").join(m.as_str()))
        .ok_or_else(|| {
            E2eError::Internal(
                "installer output does not mention a node upgrade script".to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NodeTransport;

    fn node(user: &str) -> Node {
        Node::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            PathBuf::from("/tmp/id_rsa"),
            user,
            NodeTransport::Ssh,
        )
    }

    #[test]
    fn test_as_root_leaves_root_alone() {
        let request = RunRequest::new(["systemctl", "status"]);
        let wrapped = as_root(&node("root"), request.clone());
        assert_eq!(wrapped.command_line(), request.command_line());
    }

    #[test]
    fn test_as_root_uses_sudo() {
        let request = RunRequest::new(["bash", "/genconf/serve/dcos_install.sh", "master"])
            .env("A", "1")
            .output(Output::LogAndCapture);
        let wrapped = as_root(&node("centos"), request);

        assert_eq!(
            wrapped.command_line(),
            "sudo sh -c 'export A=1 && bash /genconf/serve/dcos_install.sh master'"
        );
        assert_eq!(wrapped.output, Output::LogAndCapture);
    }

    #[test]
    fn test_upgrade_script_path() {
        let output = "Generating configuration files...\n\
            Node upgrade script URL: http://172.17.0.1:8080/upgrade/0a1b2c3d/dcos_node_upgrade.sh\n";
        assert_eq!(
            upgrade_script_path(output).unwrap(),
            PathBuf::from("/genconf/serve/upgrade/0a1b2c3d/dcos_node_upgrade.sh")
        );
        assert!(upgrade_script_path("nothing useful").is_err());
    }

    #[test]
    fn test_expand_directories() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(certs.join("nested")).unwrap();
        std::fs::write(certs.join("ca.crt"), "ca").unwrap();
        std::fs::write(certs.join("nested").join("key.pem"), "key").unwrap();
        let license = dir.path().join("license.txt");
        std::fs::write(&license, "license").unwrap();

        let files = GenconfFiles::default()
            .with_file(&certs, "certs")
            .with_file(&license, "license.txt")
            .expand()
            .unwrap();

        let remotes: Vec<_> = files.iter().map(|(_, remote)| remote.clone()).collect();
        assert_eq!(
            remotes,
            vec![
                PathBuf::from("/genconf/certs/ca.crt"),
                PathBuf::from("/genconf/certs/nested/key.pem"),
                PathBuf::from("/genconf/license.txt"),
            ]
        );
    }

    #[test]
    fn test_default_ip_detect_uses_eth0() {
        assert!(GenconfFiles::default().ip_detect().contains("eth0"));
    }
}
