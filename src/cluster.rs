//! Cluster façade
//!
//! A [`Cluster`] couples the nodes a backend created with installation,
//! readiness and teardown. Clusters built from existing nodes are read-only:
//! they can run commands and be waited on, but not installed or destroyed.

use crate::backend::{
    new_cluster_id, ClusterBackend, ClusterManager, ClusterSpec, ExistingNodes,
};
use crate::config;
use crate::error::{E2eError, Result};
use crate::installer::{self, DcosVariant, VariantChoice};
use crate::node::{BuildInfo, GenconfFiles, InstallerLocation, Node, NodeGroups, Role};
use crate::readiness::{ReadinessEngine, ReadinessOptions, ReadinessReport};
use crate::transport::{shell_quote, CommandOutput, Output, RunRequest};
use futures::stream::{self, TryStreamExt};
use serde_yaml::Mapping;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory holding the DC/OS integration tests on every master
const INTEGRATION_TEST_DIR: &str = "/opt/mesosphere/active/dcos-integration-test";

/// Environment DC/OS provides for its own tools
const ENVIRONMENT_EXPORT: &str = "/opt/mesosphere/environment.export";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Install,
    Upgrade,
}

/// A DC/OS cluster
pub struct Cluster {
    manager: Box<dyn ClusterManager>,
    genconf: GenconfFiles,
    readiness: Option<ReadinessEngine>,
    variant: Option<DcosVariant>,
}

impl Cluster {
    /// Create machines with `backend`. `files_to_stage` are `(host path,
    /// path under /genconf)` pairs copied to every node before install.
    pub async fn create(
        backend: &dyn ClusterBackend,
        spec: &ClusterSpec,
        files_to_stage: &[(PathBuf, PathBuf)],
    ) -> Result<Self> {
        let manager = backend.create(spec).await?;
        info!(
            cluster_id = %manager.cluster_id(),
            nodes = manager.nodes().len(),
            "Cluster created"
        );
        let mut cluster = Self::from_manager(manager, files_to_stage);
        cluster.variant = spec.variant;
        Ok(cluster)
    }

    /// Create machines for the variant `installer` will install. With
    /// [`VariantChoice::Auto`] the installer is asked before any machine
    /// exists, so the variant is recorded in every resource's labels.
    pub async fn create_for_installer(
        backend: &dyn ClusterBackend,
        spec: &ClusterSpec,
        choice: VariantChoice,
        installer: &Path,
        files_to_stage: &[(PathBuf, PathBuf)],
    ) -> Result<Self> {
        let variant = installer::resolve_variant(choice, installer, &std::env::temp_dir()).await?;
        info!(variant = %variant, "Creating cluster");
        let spec = spec.clone().variant(variant);
        Self::create(backend, &spec, files_to_stage).await
    }

    /// Wrap an existing manager
    pub fn from_manager(
        manager: Box<dyn ClusterManager>,
        files_to_stage: &[(PathBuf, PathBuf)],
    ) -> Self {
        let genconf = GenconfFiles::new(manager.ip_detect_script()).with_files(files_to_stage);
        Self {
            manager,
            genconf,
            readiness: None,
            variant: None,
        }
    }

    /// A read-only cluster over nodes provisioned elsewhere
    pub fn from_nodes(
        masters: BTreeSet<Node>,
        agents: BTreeSet<Node>,
        public_agents: BTreeSet<Node>,
    ) -> Self {
        let nodes = NodeGroups::new(masters, agents, public_agents);
        Self::from_manager(Box::new(ExistingNodes::new(&new_cluster_id(), nodes)), &[])
    }

    /// Find a cluster created earlier, possibly by another process
    pub async fn rediscover(backend: &dyn ClusterBackend, cluster_id: &str) -> Result<Self> {
        let manager = backend.rediscover(cluster_id).await?;
        Ok(Self::from_manager(manager, &[]))
    }

    /// Use a specific readiness engine instead of the one suited to the nodes
    pub fn with_readiness_engine(mut self, engine: ReadinessEngine) -> Self {
        self.readiness = Some(engine);
        self
    }

    pub fn cluster_id(&self) -> &str {
        self.manager.cluster_id()
    }

    pub fn nodes(&self) -> &NodeGroups {
        self.manager.nodes()
    }

    pub fn masters(&self) -> &BTreeSet<Node> {
        self.manager.masters()
    }

    pub fn agents(&self) -> &BTreeSet<Node> {
        self.manager.agents()
    }

    pub fn public_agents(&self) -> &BTreeSet<Node> {
        self.manager.public_agents()
    }

    pub fn workspace_dir(&self) -> Option<&Path> {
        self.manager.workspace_dir()
    }

    /// The variant chosen when the cluster was created, if known
    pub fn variant(&self) -> Option<DcosVariant> {
        self.variant
    }

    /// Backend config, then node lists, then `overrides`
    pub fn merged_config(&self, overrides: &Mapping) -> Mapping {
        let base = config::with_node_lists(&self.manager.base_config(), self.nodes());
        config::merge(&base, overrides)
    }

    /// Install DC/OS on every node from an installer on the host
    pub async fn install_from_path(
        &self,
        installer: &Path,
        overrides: &Mapping,
        output: Output,
    ) -> Result<()> {
        self.ensure_owned("install")?;
        let location = self.stage(installer).await?;
        self.fan_out(Operation::Install, &location, overrides, output).await
    }

    /// Install DC/OS on every node from an installer URL
    pub async fn install_from_url(
        &self,
        url: &str,
        overrides: &Mapping,
        output: Output,
    ) -> Result<()> {
        self.ensure_owned("install")?;
        let location = InstallerLocation::Url(url.to_string());
        self.fan_out(Operation::Install, &location, overrides, output).await
    }

    /// Upgrade every node from an installer on the host
    pub async fn upgrade_from_path(
        &self,
        installer: &Path,
        overrides: &Mapping,
        output: Output,
    ) -> Result<()> {
        self.ensure_owned("upgrade")?;
        let location = self.stage(installer).await?;
        self.fan_out(Operation::Upgrade, &location, overrides, output).await
    }

    /// Variant and version of an installer, without installing it
    pub async fn detect_variant(&self, installer: &Path) -> Result<(DcosVariant, String)> {
        let scratch = self
            .workspace_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        installer::get_variant_and_version(installer, &scratch).await
    }

    /// Build installed on the first master
    pub async fn installed_build(&self) -> Result<BuildInfo> {
        self.first_master()?.build_info().await
    }

    /// Wait until the cluster is usable. The variant the cluster was created
    /// for is used when `options` names none.
    pub async fn wait_for_ready(&self, options: &ReadinessOptions) -> Result<ReadinessReport> {
        let mut options = options.clone();
        if options.variant.is_none() {
            options.variant = self.variant;
        }

        match &self.readiness {
            Some(engine) => engine.wait_for_ready(self.nodes(), &options).await,
            None => {
                ReadinessEngine::for_nodes(self.nodes(), &options)?
                    .wait_for_ready(self.nodes(), &options)
                    .await
            }
        }
    }

    /// Run a command in the integration test directory of `node` (the first
    /// master by default) with the cluster's test environment exported.
    /// The variables are exported after DC/OS's own environment is sourced,
    /// and `env` wins over the defaults.
    pub async fn run_with_test_environment(
        &self,
        args: &[&str],
        node: Option<&Node>,
        env: &BTreeMap<String, String>,
        output: Output,
    ) -> Result<CommandOutput> {
        let node = match node {
            Some(node) => node,
            None => self.first_master()?,
        };

        let mut environment = self.test_environment()?;
        environment.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let exports = environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect::<Vec<_>>()
            .join(" ");
        let command = args
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");

        let snippet = format!(
            "source {} && export {} && cd {} && {}",
            ENVIRONMENT_EXPORT, exports, INTEGRATION_TEST_DIR, command
        );
        node.run(&RunRequest::shell_snippet(snippet).output(output)).await
    }

    /// Destroy one node, if the backend supports it
    pub async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        self.manager.destroy_node(node).await
    }

    /// Destroy every resource of the cluster
    pub async fn destroy(mut self) -> Result<()> {
        self.ensure_owned("destroy")?;
        let cluster_id = self.cluster_id().to_string();
        self.manager.destroy().await?;
        info!(cluster_id = %cluster_id, "Cluster destroyed");
        Ok(())
    }

    fn ensure_owned(&self, operation: &str) -> Result<()> {
        if self.manager.owns_resources() {
            return Ok(());
        }
        Err(E2eError::UnsupportedOperation(format!(
            "cannot {} a cluster built from existing nodes",
            operation
        )))
    }

    fn first_master(&self) -> Result<&Node> {
        self.masters()
            .iter()
            .next()
            .ok_or_else(|| E2eError::NodeNotFound("cluster has no masters".to_string()))
    }

    async fn stage(&self, installer: &Path) -> Result<InstallerLocation> {
        Ok(self
            .manager
            .stage_installer(installer)
            .await?
            .unwrap_or_else(|| InstallerLocation::Local(installer.to_path_buf())))
    }

    fn test_environment(&self) -> Result<BTreeMap<String, String>> {
        let private_ips = |nodes: &BTreeSet<Node>| {
            nodes
                .iter()
                .map(|node| node.private_ip().to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let first_master = self.first_master()?;

        let env = [
            ("MASTER_HOSTS", private_ips(self.masters())),
            ("SLAVE_HOSTS", private_ips(self.agents())),
            ("PUBLIC_SLAVE_HOSTS", private_ips(self.public_agents())),
            (
                "PUBLIC_MASTER_HOSTS",
                self.masters()
                    .iter()
                    .map(|node| node.public_ip().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("DCOS_DNS_ADDRESS", format!("http://{}", first_master.private_ip())),
            ("DCOS_PROVIDER", "onprem".to_string()),
            ("DNS_SEARCH", "false".to_string()),
            ("PYTHONUNBUFFERED", "true".to_string()),
            ("PYTHONDONTWRITEBYTECODE", "true".to_string()),
        ];
        Ok(env.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Run `operation` on every node, one role at a time, masters first.
    /// Nodes of the same role run concurrently.
    async fn fan_out(
        &self,
        operation: Operation,
        location: &InstallerLocation,
        overrides: &Mapping,
        output: Output,
    ) -> Result<()> {
        let config = self.merged_config(overrides);
        let config = &config;
        let genconf = &self.genconf;
        let limit = num_cpus::get().max(1);

        for role in Role::ALL {
            let nodes = self.nodes().by_role(role);
            if nodes.is_empty() {
                continue;
            }
            info!(role = %role, nodes = nodes.len(), "{:?} starting", operation);

            stream::iter(nodes.iter().map(Ok::<_, E2eError>))
                .try_for_each_concurrent(limit, move |node| async move {
                    match operation {
                        Operation::Install => {
                            node.install_from(location, config, role, genconf, output).await
                        }
                        Operation::Upgrade => {
                            node.upgrade_from(location, config, role, genconf, output).await
                        }
                    }
                })
                .await?;
        }

        info!(
            cluster_id = %self.cluster_id(),
            "{:?} finished on every node",
            operation
        );
        Ok(())
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("cluster_id", &self.cluster_id())
            .field("nodes", self.nodes())
            .field("owns_resources", &self.manager.owns_resources())
            .finish()
    }
}
