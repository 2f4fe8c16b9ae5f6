//! Thin wrapper over the `docker` command line

use crate::error::{E2eError, Result};
use crate::exec;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::process::Command;

/// Arguments for `docker run`
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// `host:container[:mode]` bind mounts
    pub volumes: Vec<String>,
    pub tmpfs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub privileged: bool,
    pub network: Option<String>,
}

impl ContainerSpec {
    /// Arguments following `docker`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--hostname".to_string(),
            self.hostname.clone(),
        ];
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &self.volumes {
            args.push("--volume".to_string());
            args.push(volume.clone());
        }
        for tmpfs in &self.tmpfs {
            args.push("--tmpfs".to_string());
            args.push(tmpfs.clone());
        }
        args.push(self.image.clone());
        args
    }
}

/// Subset of `docker inspect` output
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: InspectConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(default)]
    pub networks: HashMap<String, NetworkEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl ContainerInspect {
    /// Container name without Docker's leading slash
    pub fn name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Every IP address the container has, default bridge first
    pub fn ips(&self) -> Vec<IpAddr> {
        let mut networks: Vec<_> = self.network_settings.networks.iter().collect();
        networks.sort_by(|a, b| a.0.cmp(b.0));

        std::iter::once(self.network_settings.ip_address.as_str())
            .chain(networks.into_iter().map(|(_, ep)| ep.ip_address.as_str()))
            .filter_map(|ip| ip.parse().ok())
            .fold(Vec::new(), |mut acc, ip| {
                if !acc.contains(&ip) {
                    acc.push(ip);
                }
                acc
            })
    }

    /// The address nodes are reached on
    pub fn ip(&self) -> Option<IpAddr> {
        self.ips().into_iter().next()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.config
            .labels
            .as_ref()
            .map(|labels| labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// Docker command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// Use a specific docker binary
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// A bare `docker` command
    pub fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Start a container and return its ID
    pub async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut command = self.command();
        command.args(spec.run_args());
        exec::execute_stdout(&mut command).await
    }

    /// IDs of all containers, running or not, carrying `key=value`
    pub async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let mut command = self.command();
        command
            .args(["ps", "--all", "--quiet", "--no-trunc", "--filter"])
            .arg(format!("label={}={}", key, value));
        Ok(split_ids(&exec::execute_stdout(&mut command).await?))
    }

    /// IDs of all running containers
    pub async fn list_running(&self) -> Result<Vec<String>> {
        let mut command = self.command();
        command.args(["ps", "--quiet", "--no-trunc"]);
        Ok(split_ids(&exec::execute_stdout(&mut command).await?))
    }

    pub async fn inspect(&self, ids: &[String]) -> Result<Vec<ContainerInspect>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut command = self.command();
        command.arg("inspect").args(ids);
        let stdout = exec::execute_stdout(&mut command).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Force-remove containers and their anonymous volumes
    pub async fn remove(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut command = self.command();
        command.args(["rm", "--force", "--volumes"]).args(ids);
        exec::execute(&mut command).await?;
        Ok(())
    }

    /// Run a shell snippet as root inside a container
    pub async fn exec_shell(&self, container: &str, script: &str) -> Result<String> {
        let mut command = self.command();
        command
            .args(["exec", container, "/bin/sh", "-c"])
            .arg(script);
        exec::execute_stdout(&mut command).await
    }

    /// Storage driver of the host's docker daemon
    pub async fn storage_driver(&self) -> Result<String> {
        let mut command = self.command();
        command.args(["info", "--format", "{{.Driver}}"]);
        exec::execute_stdout(&mut command).await
    }

    /// The running container that owns `ip`
    pub async fn container_for_ip(&self, ip: IpAddr) -> Result<ContainerInspect> {
        let ids = self.list_running().await?;
        self.inspect(&ids)
            .await?
            .into_iter()
            .find(|container| container.ips().contains(&ip))
            .ok_or_else(|| {
                E2eError::NodeNotFound(format!("no running container has IP address {}", ip))
            })
    }
}

fn split_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
