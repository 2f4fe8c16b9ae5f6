//! Backend resource drivers
//!
//! A [`ClusterBackend`] turns a [`ClusterSpec`] into machines and hands back
//! a [`ClusterManager`] for them. Every driver labels what it creates with
//! the schema in [`crate::labels`] and finds its resources again through
//! those labels alone.

pub mod aws;
pub mod docker;
pub mod existing;
pub mod vagrant;

pub use aws::{AwsBackend, AwsConfig};
pub use docker::{DockerBackend, DockerConfig};
pub use existing::ExistingNodes;
pub use vagrant::{VagrantBackend, VagrantConfig};

use crate::error::{E2eError, Result};
use crate::installer::DcosVariant;
use crate::node::install::DEFAULT_IP_DETECT;
use crate::node::{InstallerLocation, Node, NodeGroups, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use uuid::Uuid;

/// Operating system on the nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distribution {
    #[default]
    Centos7,
    Coreos,
    Ubuntu1604,
    Rhel7,
}

impl Distribution {
    /// User that can log in on a fresh cloud image
    pub fn default_ssh_user(&self) -> &'static str {
        match self {
            Distribution::Centos7 => "centos",
            Distribution::Coreos => "core",
            Distribution::Ubuntu1604 => "ubuntu",
            Distribution::Rhel7 => "ec2-user",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Centos7 => "centos-7",
            Distribution::Coreos => "coreos",
            Distribution::Ubuntu1604 => "ubuntu-16.04",
            Distribution::Rhel7 => "rhel-7",
        }
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Distribution {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "centos-7" => Ok(Distribution::Centos7),
            "coreos" => Ok(Distribution::Coreos),
            "ubuntu-16.04" => Ok(Distribution::Ubuntu1604),
            "rhel-7" => Ok(Distribution::Rhel7),
            other => Err(E2eError::InvalidConfig(format!(
                "unknown distribution: {}",
                other
            ))),
        }
    }
}

/// How many nodes of each role to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub masters: usize,
    pub agents: usize,
    pub public_agents: usize,
    /// Recorded in every resource's labels when known
    pub variant: Option<DcosVariant>,
    /// Extra labels for every resource
    pub labels: BTreeMap<String, String>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            masters: 1,
            agents: 1,
            public_agents: 1,
            variant: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ClusterSpec {
    pub fn new(masters: usize, agents: usize, public_agents: usize) -> Self {
        Self {
            masters,
            agents,
            public_agents,
            ..Default::default()
        }
    }

    pub fn variant(mut self, variant: DcosVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Number of nodes to create for a role
    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Master => self.masters,
            Role::Agent => self.agents,
            Role::PublicAgent => self.public_agents,
        }
    }
}

/// The machines of one cluster and what can be done to them
#[async_trait]
pub trait ClusterManager: Send + Sync {
    fn cluster_id(&self) -> &str;

    fn nodes(&self) -> &NodeGroups;

    fn masters(&self) -> &BTreeSet<Node> {
        &self.nodes().masters
    }

    fn agents(&self) -> &BTreeSet<Node> {
        &self.nodes().agents
    }

    fn public_agents(&self) -> &BTreeSet<Node> {
        &self.nodes().public_agents
    }

    /// DC/OS config this backend needs, before caller overrides
    fn base_config(&self) -> Mapping;

    /// Script that prints a node's private IP
    fn ip_detect_script(&self) -> &str {
        DEFAULT_IP_DETECT
    }

    fn workspace_dir(&self) -> Option<&Path> {
        None
    }

    /// Put an installer where every node can already see it. `None` means
    /// each node has to be sent its own copy.
    async fn stage_installer(&self, _installer: &Path) -> Result<Option<InstallerLocation>> {
        Ok(None)
    }

    /// Whether this manager created, and may destroy, its machines
    fn owns_resources(&self) -> bool {
        true
    }

    /// Destroy one node and forget it
    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        Err(E2eError::UnsupportedOperation(format!(
            "destroying a single node ({}) is not supported by this backend",
            node
        )))
    }

    /// Destroy every machine of the cluster and its workspace
    async fn destroy(&mut self) -> Result<()>;
}

/// A provider that can create clusters and find them again
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Create machines for `spec`. On failure, whatever was created is left
    /// in place for the caller to destroy.
    async fn create(&self, spec: &ClusterSpec) -> Result<Box<dyn ClusterManager>>;

    /// Rebuild the manager of an existing cluster from resource labels
    async fn rediscover(&self, cluster_id: &str) -> Result<Box<dyn ClusterManager>>;
}

/// Fresh ID for a new cluster
pub fn new_cluster_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Error for a cluster ID no resources carry
pub(crate) fn cluster_not_found(cluster_id: &str) -> E2eError {
    E2eError::NodeNotFound(format!("no resources labelled with cluster ID {}", cluster_id))
}

/// Config keys shared by every backend
pub(crate) fn common_config() -> Mapping {
    crate::config::mapping([
        ("cluster_name", Value::from("DCOS")),
        ("master_discovery", Value::from("static")),
        ("exhibitor_storage_backend", Value::from("static")),
        ("bootstrap_url", Value::from("file:///genconf/serve")),
        ("check_time", Value::Bool(false)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_names() {
        for distribution in [
            Distribution::Centos7,
            Distribution::Coreos,
            Distribution::Ubuntu1604,
            Distribution::Rhel7,
        ] {
            assert_eq!(distribution.name().parse::<Distribution>().unwrap(), distribution);
        }
        assert_eq!(Distribution::Coreos.default_ssh_user(), "core");
        assert!("windows".parse::<Distribution>().is_err());
    }

    #[test]
    fn test_cluster_spec() {
        let spec = ClusterSpec::new(3, 2, 0).label("owner", "ci");
        assert_eq!(spec.count(Role::Master), 3);
        assert_eq!(spec.count(Role::PublicAgent), 0);
        assert_eq!(spec.labels.get("owner").unwrap(), "ci");
    }

    #[test]
    fn test_cluster_ids_are_unique() {
        let a = new_cluster_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_cluster_id());
    }

    #[test]
    fn test_common_config() {
        let config = common_config();
        assert_eq!(config.get("master_discovery").unwrap(), "static");
        assert_eq!(config.get("bootstrap_url").unwrap(), "file:///genconf/serve");
    }
}
