//! Container-runtime backend
//!
//! Each node is a privileged container running systemd and its own Docker
//! daemon. All containers of a cluster share the host workspace's
//! `dcos_install_tmp` directory, so the installer is copied once on the host
//! instead of once per node.

pub mod cli;

pub use cli::{ContainerInspect, ContainerSpec, DockerCli};

use super::{
    cluster_not_found, common_config, new_cluster_id, ClusterBackend, ClusterManager, ClusterSpec,
    Distribution,
};
use crate::error::{E2eError, Result};
use crate::labels::{self, LabelSet};
use crate::node::install::INSTALL_TMP_DIR;
use crate::node::{InstallerLocation, Node, NodeGroups, Role};
use crate::transport::docker_exec::DockerExecTransport;
use crate::transport::{shell_quote, NodeTransport};
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Storage drivers the node's inner Docker daemon can run on
const SUPPORTED_STORAGE_DRIVERS: [&str; 3] = ["aufs", "overlay", "overlay2"];
const FALLBACK_STORAGE_DRIVER: &str = "overlay2";

/// Options for the container backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// `docker` binary on the host
    pub docker_binary: String,
    /// Prefix of every container name
    pub container_name_prefix: String,
    pub distribution: Distribution,
    /// Node image per distribution; unset distributions use
    /// `<image_repository>:<distribution>`
    pub images: HashMap<Distribution, String>,
    pub image_repository: String,
    /// Storage driver for the inner Docker daemon; follows the host when unset
    pub storage_driver: Option<String>,
    /// Bind-mount the host's `/sys/fs/cgroup` read-only
    pub mount_sys_fs_cgroup: bool,
    /// Extra `host:container[:mode]` mounts per role
    pub volumes: BTreeMap<Role, Vec<String>>,
    /// Extra labels for every container
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    /// How nodes are reached after creation
    pub transport: NodeTransport,
    /// Parent of the workspace directory; the system temp dir when unset
    pub workspace_parent: Option<PathBuf>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            container_name_prefix: "dcos-e2e".to_string(),
            distribution: Distribution::default(),
            images: HashMap::new(),
            image_repository: "mesosphere/dcos-e2e-node".to_string(),
            storage_driver: None,
            mount_sys_fs_cgroup: true,
            volumes: BTreeMap::new(),
            labels: BTreeMap::new(),
            network: None,
            transport: NodeTransport::default(),
            workspace_parent: None,
        }
    }
}

impl DockerConfig {
    pub fn docker_binary(mut self, binary: &str) -> Self {
        self.docker_binary = binary.to_string();
        self
    }

    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn image(mut self, distribution: Distribution, image: &str) -> Self {
        self.images.insert(distribution, image.to_string());
        self
    }

    pub fn storage_driver(mut self, driver: &str) -> Self {
        self.storage_driver = Some(driver.to_string());
        self
    }

    pub fn mount_sys_fs_cgroup(mut self, mount: bool) -> Self {
        self.mount_sys_fs_cgroup = mount;
        self
    }

    pub fn volume(mut self, role: Role, volume: &str) -> Self {
        self.volumes.entry(role).or_default().push(volume.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    pub fn transport(mut self, transport: NodeTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn workspace_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.workspace_parent = Some(parent.into());
        self
    }

    /// Image used for nodes of the configured distribution
    pub fn node_image(&self) -> String {
        self.images
            .get(&self.distribution)
            .cloned()
            .unwrap_or_else(|| format!("{}:{}", self.image_repository, self.distribution))
    }
}

/// Name of the `index`th container of `role`
pub fn container_name(prefix: &str, cluster_id: &str, role: Role, index: usize) -> String {
    format!("{}-{}-{}-{}", prefix, cluster_id, role.label_value().replace('_', "-"), index)
}

/// Storage driver for the inner daemon, given the host's
pub fn select_storage_driver(host_driver: &str) -> &str {
    if SUPPORTED_STORAGE_DRIVERS.contains(&host_driver) {
        host_driver
    } else {
        FALLBACK_STORAGE_DRIVER
    }
}

/// Creates clusters of containers
#[derive(Debug, Clone, Default)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn docker(&self) -> DockerCli {
        DockerCli::new(&self.config.docker_binary)
    }

    async fn storage_driver(&self, docker: &DockerCli) -> Result<String> {
        if let Some(driver) = &self.config.storage_driver {
            return Ok(driver.clone());
        }
        let host = docker.storage_driver().await?;
        let selected = select_storage_driver(&host);
        if selected != host {
            warn!(
                "Host storage driver {} is not supported for nodes, using {}",
                host, selected
            );
        }
        Ok(selected.to_string())
    }

    /// Handle on a node container, reached the configured way. `docker exec`
    /// goes through the same binary that created the container.
    fn node_at(&self, docker: &DockerCli, ip: IpAddr, ssh_key_path: PathBuf) -> Node {
        match self.config.transport {
            NodeTransport::DockerExec => Node::with_transport(
                ip,
                ip,
                ssh_key_path,
                "root",
                Arc::new(DockerExecTransport::new(docker.clone())),
            ),
            NodeTransport::Ssh => Node::new(ip, ip, ssh_key_path, "root", NodeTransport::Ssh),
        }
    }

    fn container_spec(
        &self,
        name: &str,
        labels: &LabelSet,
        workspace: &Workspace,
        extra: &BTreeMap<String, String>,
    ) -> ContainerSpec {
        let mut spec = ContainerSpec {
            name: name.to_string(),
            hostname: name.to_string(),
            image: self.config.node_image(),
            privileged: true,
            network: self.config.network.clone(),
            tmpfs: vec![
                "/run:rw,exec,nosuid,size=2097152k".to_string(),
                "/tmp:rw,exec,nosuid,size=2097152k".to_string(),
            ],
            ..Default::default()
        };

        spec.labels = self.config.labels.clone();
        spec.labels.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        spec.labels.extend(labels.to_map());

        spec.volumes.push(format!(
            "{}:{}",
            workspace.install_tmp_dir().display(),
            INSTALL_TMP_DIR
        ));
        spec.volumes.push("/lib/modules:/lib/modules:ro".to_string());
        if self.config.mount_sys_fs_cgroup {
            spec.volumes.push("/sys/fs/cgroup:/sys/fs/cgroup:ro".to_string());
        }
        if let Some(volumes) = self.config.volumes.get(&labels.role) {
            spec.volumes.extend(volumes.iter().cloned());
        }
        spec
    }

    /// Start one node container and make it reachable
    async fn start_node(
        &self,
        docker: &DockerCli,
        spec: &ContainerSpec,
        workspace: &Workspace,
        public_key: &str,
        storage_driver: &str,
    ) -> Result<Node> {
        let id = docker.run_container(spec).await?;
        let container = docker
            .inspect(std::slice::from_ref(&id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                E2eError::ResourceCreationFailed(format!("container {} vanished", spec.name))
            })?;
        let ip = container.ip().ok_or_else(|| {
            E2eError::ResourceCreationFailed(format!("container {} has no IP address", spec.name))
        })?;

        docker
            .exec_shell(&id, &post_start_script(public_key, storage_driver))
            .await?;

        Ok(self.node_at(docker, ip, workspace.ssh_key_path()))
    }

    async fn find_containers(
        &self,
        docker: &DockerCli,
        cluster_id: &str,
    ) -> Result<Vec<ContainerInspect>> {
        let ids = docker.list_by_label(labels::CLUSTER_ID, cluster_id).await?;
        docker.inspect(&ids).await
    }
}

/// Install the cluster key and point the inner daemon at its storage driver
fn post_start_script(public_key: &str, storage_driver: &str) -> String {
    let daemon_json = serde_json::json!({ "storage-driver": storage_driver }).to_string();
    [
        "mkdir -p /root/.ssh".to_string(),
        format!("echo {} >> /root/.ssh/authorized_keys", shell_quote(public_key)),
        "chmod 700 /root/.ssh".to_string(),
        "chmod 600 /root/.ssh/authorized_keys".to_string(),
        "mkdir -p /etc/docker".to_string(),
        format!("echo {} > /etc/docker/daemon.json", shell_quote(&daemon_json)),
    ]
    .join(" && ")
}

#[async_trait]
impl ClusterBackend for DockerBackend {
    async fn create(&self, spec: &ClusterSpec) -> Result<Box<dyn ClusterManager>> {
        let docker = self.docker();
        let cluster_id = new_cluster_id();
        let workspace = Workspace::create(self.config.workspace_parent.as_deref(), &cluster_id)
            .await
            .map_err(|e| E2eError::ResourceCreationFailed(format!("workspace: {}", e)))?;
        let public_key = workspace.public_key().await?;
        let storage_driver = self.storage_driver(&docker).await?;

        info!(
            cluster_id = %cluster_id,
            masters = spec.masters,
            agents = spec.agents,
            public_agents = spec.public_agents,
            image = %self.config.node_image(),
            "Creating container cluster"
        );

        let mut nodes = NodeGroups::default();
        for role in Role::ALL {
            for index in 0..spec.count(role) {
                let prefix = &self.config.container_name_prefix;
                let name = container_name(prefix, &cluster_id, role, index);
                let labels =
                    LabelSet::new(&cluster_id, role, workspace.path()).variant(spec.variant);
                let container = self.container_spec(&name, &labels, &workspace, &spec.labels);

                let node = self
                    .start_node(&docker, &container, &workspace, &public_key, &storage_driver)
                    .await
                    .map_err(|e| E2eError::ResourceCreationFailed(format!("{}: {}", name, e)))?;
                info!(node = %node, role = %role, container = %name, "Started node container");
                nodes.by_role_mut(role).insert(node);
            }
        }

        Ok(Box::new(DockerCluster {
            cluster_id,
            nodes,
            workspace,
            docker,
        }))
    }

    async fn rediscover(&self, cluster_id: &str) -> Result<Box<dyn ClusterManager>> {
        let docker = self.docker();
        let containers = self.find_containers(&docker, cluster_id).await?;
        if containers.is_empty() {
            return Err(cluster_not_found(cluster_id));
        }

        let mut nodes = NodeGroups::default();
        let mut workspace = None;
        for container in containers {
            let labels = LabelSet::from_map(&container.labels(), &[])?;
            let ip = container.ip().ok_or_else(|| {
                E2eError::NodeNotFound(format!(
                    "container {} has no IP address",
                    container.name()
                ))
            })?;
            let ws = Workspace::open(&labels.workspace_dir);
            nodes
                .by_role_mut(labels.role)
                .insert(self.node_at(&docker, ip, ws.ssh_key_path()));
            workspace = Some(ws);
        }

        let workspace = workspace.ok_or_else(|| cluster_not_found(cluster_id))?;
        Ok(Box::new(DockerCluster {
            cluster_id: cluster_id.to_string(),
            nodes,
            workspace,
            docker,
        }))
    }
}

/// A cluster of node containers
#[derive(Debug)]
pub struct DockerCluster {
    cluster_id: String,
    nodes: NodeGroups,
    workspace: Workspace,
    docker: DockerCli,
}

#[async_trait]
impl ClusterManager for DockerCluster {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn nodes(&self) -> &NodeGroups {
        &self.nodes
    }

    fn base_config(&self) -> Mapping {
        let mut config = common_config();
        let resolvers = vec![Value::from("8.8.8.8"), Value::from("8.8.4.4")];
        config.insert("resolvers".into(), Value::Sequence(resolvers));
        config.insert("process_timeout".into(), Value::from(10000));
        config.insert("fault_domain_enabled".into(), Value::Bool(false));
        config
    }

    fn workspace_dir(&self) -> Option<&Path> {
        Some(self.workspace.path())
    }

    async fn stage_installer(&self, installer: &Path) -> Result<Option<InstallerLocation>> {
        let shared = self.workspace.install_tmp_dir().join("dcos_generate_config.sh");
        tokio::fs::copy(installer, &shared).await?;
        info!(cluster_id = %self.cluster_id, "Staged installer in shared install directory");
        Ok(Some(InstallerLocation::Staged(
            Path::new(INSTALL_TMP_DIR).join("dcos_generate_config.sh"),
        )))
    }

    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        let container = self.docker.container_for_ip(node.public_ip()).await?;
        if !LabelSet::belongs_to(&container.labels(), &self.cluster_id) {
            return Err(E2eError::NodeNotFound(format!(
                "{} is not part of cluster {}",
                node, self.cluster_id
            )));
        }
        self.docker.remove(&[container.id.clone()]).await?;
        self.nodes.remove(node);
        info!(node = %node, container = %container.name(), "Destroyed node container");
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        let ids = self.docker.list_by_label(labels::CLUSTER_ID, &self.cluster_id).await?;
        self.docker.remove(&ids).await?;
        self.workspace.remove().await?;
        self.nodes = NodeGroups::default();
        info!(cluster_id = %self.cluster_id, containers = ids.len(), "Destroyed container cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_docker;
    use crate::transport::RunRequest;

    #[test]
    fn test_container_names() {
        assert_eq!(
            container_name("dcos-e2e", "abc", Role::PublicAgent, 2),
            "dcos-e2e-abc-public-agent-2"
        );
        assert_eq!(container_name("ci", "abc", Role::Master, 0), "ci-abc-master-0");
    }

    #[test]
    fn test_storage_driver_fallback() {
        assert_eq!(select_storage_driver("aufs"), "aufs");
        assert_eq!(select_storage_driver("overlay2"), "overlay2");
        assert_eq!(select_storage_driver("devicemapper"), "overlay2");
        assert_eq!(select_storage_driver(""), "overlay2");
    }

    #[test]
    fn test_node_image() {
        let config = DockerConfig::default();
        assert_eq!(config.node_image(), "mesosphere/dcos-e2e-node:centos-7");

        let config = DockerConfig::default()
            .distribution(Distribution::Ubuntu1604)
            .image(Distribution::Ubuntu1604, "local/ubuntu-node:dev");
        assert_eq!(config.node_image(), "local/ubuntu-node:dev");
    }

    #[test]
    fn test_container_spec_labels_and_mounts() {
        let backend = DockerBackend::new(
            DockerConfig::default()
                .label("owner", "ci")
                .volume(Role::Agent, "/var/lib/mesos-data:/var/lib/mesos")
                .mount_sys_fs_cgroup(false),
        );
        let workspace = Workspace::open("/tmp/dcos-e2e-abc");
        let labels = LabelSet::new("abc", Role::Agent, workspace.path());
        let name = "dcos-e2e-abc-agent-0";
        let spec = backend.container_spec(name, &labels, &workspace, &BTreeMap::new());

        assert_eq!(spec.labels.get("owner").unwrap(), "ci");
        assert_eq!(spec.labels.get(labels::NODE_TYPE).unwrap(), "agent");
        assert!(spec
            .volumes
            .contains(&"/tmp/dcos-e2e-abc/dcos_install_tmp:/dcos_install_tmp".to_string()));
        assert!(spec.volumes.contains(&"/var/lib/mesos-data:/var/lib/mesos".to_string()));
        assert!(!spec.volumes.iter().any(|v| v.starts_with("/sys/fs/cgroup")));

        let decoded = LabelSet::from_map(&spec.labels, &[]).unwrap();
        assert_eq!(decoded, labels);
    }

    #[test]
    fn test_reserved_labels_win_over_extra() {
        let backend =
            DockerBackend::new(DockerConfig::default().label(labels::CLUSTER_ID, "spoofed"));
        let workspace = Workspace::open("/w");
        let labels = LabelSet::new("real", Role::Master, workspace.path());
        let spec = backend.container_spec("n", &labels, &workspace, &BTreeMap::new());
        assert_eq!(spec.labels.get(labels::CLUSTER_ID).unwrap(), "real");
    }

    #[test]
    fn test_post_start_script() {
        let script = post_start_script("ssh-rsa AAAA key", "overlay2");
        assert!(script.contains("'ssh-rsa AAAA key' >> /root/.ssh/authorized_keys"));
        assert!(script.contains(r#"'{"storage-driver":"overlay2"}' > /etc/docker/daemon.json"#));
    }

    #[tokio::test]
    async fn test_docker_exec_nodes_use_configured_binary() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_docker(dir.path());
        let backend = DockerBackend::new(
            DockerConfig::default()
                .docker_binary(&fake.binary.to_string_lossy())
                .transport(NodeTransport::DockerExec),
        );

        let node = backend.node_at(&backend.docker(), "172.17.0.2".parse().unwrap(), "/k".into());
        node.run(&RunRequest::new(["true"])).await.unwrap();

        assert_eq!(node.transport(), NodeTransport::DockerExec);
        assert!(fake
            .calls()
            .contains(&"exec --user root c0ffee /bin/sh -c true".to_string()));
    }

    #[test]
    fn test_ssh_nodes() {
        let backend = DockerBackend::new(DockerConfig::default().docker_binary("/opt/docker"));
        let node = backend.node_at(&backend.docker(), "172.17.0.2".parse().unwrap(), "/k".into());
        assert_eq!(node.transport(), NodeTransport::Ssh);
        assert_eq!(node.ssh_key_path(), Path::new("/k"));
    }

    #[test]
    fn test_base_config() {
        let cluster = DockerCluster {
            cluster_id: "abc".to_string(),
            nodes: NodeGroups::default(),
            workspace: Workspace::open("/w"),
            docker: DockerCli::default(),
        };
        let config = cluster.base_config();
        assert_eq!(config.get("bootstrap_url").unwrap(), "file:///genconf/serve");
        assert!(config.contains_key("resolvers"));
        assert_eq!(cluster.workspace_dir(), Some(Path::new("/w")));
    }

    #[tokio::test]
    async fn test_stage_installer_uses_shared_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path());
        std::fs::create_dir_all(workspace.install_tmp_dir()).unwrap();
        let installer = dir.path().join("installer.sh");
        std::fs::write(&installer, "#!/bin/sh\n").unwrap();

        let cluster = DockerCluster {
            cluster_id: "abc".to_string(),
            nodes: NodeGroups::default(),
            workspace: workspace.clone(),
            docker: DockerCli::default(),
        };
        let location = cluster.stage_installer(&installer).await.unwrap();

        let staged = PathBuf::from("/dcos_install_tmp/dcos_generate_config.sh");
        assert_eq!(location, Some(InstallerLocation::Staged(staged)));
        assert!(workspace.install_tmp_dir().join("dcos_generate_config.sh").is_file());
    }
}
