//! Cluster nodes
//!
//! A [`Node`] is a handle to one remote machine: its addresses, the key and
//! user to log in with, and the transport used to reach it. Nodes are
//! immutable and compare by their (public IP, private IP) pair.

pub mod build_info;
pub mod install;

pub use build_info::BuildInfo;
pub use install::{GenconfFiles, InstallerLocation};

use crate::error::{E2eError, Result};
use crate::transport::{
    transport_for, CommandOutput, NodeTransport, Output, RemoteProcess, RunRequest, Transport,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Node role in a DC/OS cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Control plane node
    Master,
    /// Private agent
    Agent,
    /// Externally reachable agent
    PublicAgent,
}

impl Role {
    /// Every role, in install order
    pub const ALL: [Role; 3] = [Role::Master, Role::Agent, Role::PublicAgent];

    /// Value written to the `node-type` resource label
    pub fn label_value(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "agent",
            Role::PublicAgent => "public_agent",
        }
    }

    /// Role argument of `dcos_install.sh`
    pub fn install_role(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "slave",
            Role::PublicAgent => "slave_public",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label_value())
    }
}

impl std::str::FromStr for Role {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(Role::Master),
            "agent" => Ok(Role::Agent),
            "public_agent" => Ok(Role::PublicAgent),
            other => Err(E2eError::InvalidConfig(format!("unknown node role: {}", other))),
        }
    }
}

/// A remote machine in a cluster
#[derive(Clone)]
pub struct Node {
    public_ip: IpAddr,
    private_ip: IpAddr,
    ssh_key_path: PathBuf,
    default_user: String,
    transport: Arc<dyn Transport>,
}

impl Node {
    /// Create a node handle
    pub fn new(
        public_ip: IpAddr,
        private_ip: IpAddr,
        ssh_key_path: PathBuf,
        default_user: &str,
        transport: NodeTransport,
    ) -> Self {
        Self::with_transport(
            public_ip,
            private_ip,
            ssh_key_path,
            default_user,
            transport_for(transport),
        )
    }

    /// Create a node handle with a specific transport implementation
    pub fn with_transport(
        public_ip: IpAddr,
        private_ip: IpAddr,
        ssh_key_path: PathBuf,
        default_user: &str,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            public_ip,
            private_ip,
            ssh_key_path,
            default_user: default_user.to_string(),
            transport,
        }
    }

    pub fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    pub fn private_ip(&self) -> IpAddr {
        self.private_ip
    }

    pub fn ssh_key_path(&self) -> &Path {
        &self.ssh_key_path
    }

    pub fn default_user(&self) -> &str {
        &self.default_user
    }

    pub fn transport(&self) -> NodeTransport {
        self.transport.kind()
    }

    /// Run a command and wait for it. A non-zero exit is an error.
    pub async fn run(&self, request: &RunRequest) -> Result<CommandOutput> {
        self.transport.run(self, request).await
    }

    /// Start a command and return a handle to wait on later
    pub async fn popen(&self, request: &RunRequest) -> Result<RemoteProcess> {
        self.transport.popen(self, request).await
    }

    /// Copy a local file to the node as the default user
    pub async fn send_file(&self, local: &Path, remote: &Path) -> Result<()> {
        self.transport
            .send_file(self, local, remote, &self.default_user)
            .await
    }

    /// Copy a local file to the node as `user`
    pub async fn send_file_as(&self, local: &Path, remote: &Path, user: &str) -> Result<()> {
        self.transport.send_file(self, local, remote, user).await
    }

    /// Copy a file from the node to the host
    pub async fn download_file(&self, remote: &Path, local: &Path) -> Result<()> {
        self.transport
            .download_file(self, remote, local, &self.default_user)
            .await
    }

    /// Install DC/OS from an installer on the host
    pub async fn install_from_path(
        &self,
        installer: &Path,
        config: &serde_yaml::Mapping,
        role: Role,
        genconf: &GenconfFiles,
        output: Output,
    ) -> Result<()> {
        install::install(
            self,
            &InstallerLocation::Local(installer.to_path_buf()),
            config,
            role,
            genconf,
            output,
        )
        .await
    }

    /// Install DC/OS from an installer the node downloads itself
    pub async fn install_from_url(
        &self,
        url: &str,
        config: &serde_yaml::Mapping,
        role: Role,
        genconf: &GenconfFiles,
        output: Output,
    ) -> Result<()> {
        install::install(
            self,
            &InstallerLocation::Url(url.to_string()),
            config,
            role,
            genconf,
            output,
        )
        .await
    }

    /// Install DC/OS from an installer at any [`InstallerLocation`]
    pub async fn install_from(
        &self,
        installer: &InstallerLocation,
        config: &serde_yaml::Mapping,
        role: Role,
        genconf: &GenconfFiles,
        output: Output,
    ) -> Result<()> {
        install::install(self, installer, config, role, genconf, output).await
    }

    /// Upgrade the installed DC/OS from an installer on the host
    pub async fn upgrade_from_path(
        &self,
        installer: &Path,
        config: &serde_yaml::Mapping,
        role: Role,
        genconf: &GenconfFiles,
        output: Output,
    ) -> Result<()> {
        install::upgrade(
            self,
            &InstallerLocation::Local(installer.to_path_buf()),
            config,
            role,
            genconf,
            output,
        )
        .await
    }

    /// Upgrade the installed DC/OS from an installer at any location
    pub async fn upgrade_from(
        &self,
        installer: &InstallerLocation,
        config: &serde_yaml::Mapping,
        role: Role,
        genconf: &GenconfFiles,
        output: Output,
    ) -> Result<()> {
        install::upgrade(self, installer, config, role, genconf, output).await
    }

    /// Variant and version of the DC/OS build installed on this node
    pub async fn build_info(&self) -> Result<BuildInfo> {
        build_info::read(self).await
    }

    fn key(&self) -> (IpAddr, IpAddr) {
        (self.public_ip, self.private_ip)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_ip", &self.public_ip)
            .field("private_ip", &self.private_ip)
            .field("ssh_key_path", &self.ssh_key_path)
            .field("default_user", &self.default_user)
            .field("transport", &self.transport.kind())
            .finish()
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.public_ip == self.private_ip {
            write!(f, "{}", self.public_ip)
        } else {
            write!(f, "{} ({})", self.public_ip, self.private_ip)
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// The three disjoint node sets of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeGroups {
    pub masters: BTreeSet<Node>,
    pub agents: BTreeSet<Node>,
    pub public_agents: BTreeSet<Node>,
}

impl NodeGroups {
    pub fn new(
        masters: BTreeSet<Node>,
        agents: BTreeSet<Node>,
        public_agents: BTreeSet<Node>,
    ) -> Self {
        Self {
            masters,
            agents,
            public_agents,
        }
    }

    /// Nodes with the given role
    pub fn by_role(&self, role: Role) -> &BTreeSet<Node> {
        match role {
            Role::Master => &self.masters,
            Role::Agent => &self.agents,
            Role::PublicAgent => &self.public_agents,
        }
    }

    pub fn by_role_mut(&mut self, role: Role) -> &mut BTreeSet<Node> {
        match role {
            Role::Master => &mut self.masters,
            Role::Agent => &mut self.agents,
            Role::PublicAgent => &mut self.public_agents,
        }
    }

    /// Every node, masters first
    pub fn all(&self) -> impl Iterator<Item = &Node> {
        self.masters
            .iter()
            .chain(self.agents.iter())
            .chain(self.public_agents.iter())
    }

    /// Role of a node in this cluster
    pub fn role_of(&self, node: &Node) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| self.by_role(*role).contains(node))
    }

    /// Remove a node, returning the role it had
    pub fn remove(&mut self, node: &Node) -> Option<Role> {
        let role = self.role_of(node)?;
        self.by_role_mut(role).remove(node);
        Some(role)
    }

    pub fn len(&self) -> usize {
        self.masters.len() + self.agents.len() + self.public_agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
