//! VirtualBox backend driven through Vagrant
//!
//! VirtualBox has no tags, so each VM's labels are stored as a JSON object
//! in its free-text description. Discovery lists every VM on the host and
//! parses those descriptions back out of `VBoxManage` output.

use super::{
    cluster_not_found, common_config, new_cluster_id, ClusterBackend, ClusterManager, ClusterSpec,
};
use crate::error::{E2eError, Result};
use crate::exec;
use crate::labels::LabelSet;
use crate::node::{Node, NodeGroups, Role};
use crate::readiness::{wait_for_condition, CondCheckError, ReadinessState, RetryPolicy};
use crate::transport::NodeTransport;
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Guest property holding the host-only network address
const IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/1/V4/IP";

const IP_DETECT: &str = r#"#!/usr/bin/env bash
set -o nounset -o errexit
export PATH=/usr/sbin:/usr/bin:$PATH
echo $(ip addr show eth1 | grep -Eo '[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}' | head -1)
"#;

/// Options for the Vagrant backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VagrantConfig {
    pub vagrant_binary: String,
    pub vboxmanage_binary: String,
    /// Vagrant box every VM boots from
    pub box_name: String,
    pub box_url: Option<String>,
    pub memory_mb: u32,
    pub cpus: u32,
    pub workspace_parent: Option<PathBuf>,
}

impl Default for VagrantConfig {
    fn default() -> Self {
        Self {
            vagrant_binary: "vagrant".to_string(),
            vboxmanage_binary: "VBoxManage".to_string(),
            box_name: "bento/centos-7".to_string(),
            box_url: None,
            memory_mb: 4096,
            cpus: 2,
            workspace_parent: None,
        }
    }
}

impl VagrantConfig {
    pub fn box_name(mut self, name: &str) -> Self {
        self.box_name = name.to_string();
        self
    }

    pub fn box_url(mut self, url: &str) -> Self {
        self.box_url = Some(url.to_string());
        self
    }

    pub fn memory_mb(mut self, memory: u32) -> Self {
        self.memory_mb = memory;
        self
    }

    pub fn workspace_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.workspace_parent = Some(parent.into());
        self
    }
}

/// A VM to define in the Vagrantfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDefinition {
    pub name: String,
    pub labels: LabelSet,
}

/// Quote a string as a single-quoted Ruby literal
pub fn ruby_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// VM description value encoding `labels`
pub fn encode_description(labels: &LabelSet) -> Result<String> {
    Ok(serde_json::to_string(&labels.to_map())?)
}

/// Labels stored in a VM description. `None` for VMs this crate did not
/// create.
pub fn decode_description(description: &str) -> Option<BTreeMap<String, String>> {
    serde_json::from_str(description).ok()
}

/// Render a Vagrantfile for `vms`
pub fn render_vagrantfile(
    config: &VagrantConfig,
    vms: &[VmDefinition],
    public_key: &str,
    key_path: &Path,
) -> Result<String> {
    let mut file = String::new();
    let w = |e: std::fmt::Error| E2eError::Internal(e.to_string());

    writeln!(file, "Vagrant.configure('2') do |config|").map_err(w)?;
    writeln!(file, "  config.vm.box = {}", ruby_quote(&config.box_name)).map_err(w)?;
    if let Some(url) = &config.box_url {
        writeln!(file, "  config.vm.box_url = {}", ruby_quote(url)).map_err(w)?;
    }
    writeln!(file, "  config.ssh.insert_key = false").map_err(w)?;
    writeln!(
        file,
        "  config.ssh.private_key_path = [{}, '~/.vagrant.d/insecure_private_key']",
        ruby_quote(&key_path.to_string_lossy())
    )
    .map_err(w)?;
    writeln!(
        file,
        "  config.vm.provision 'shell', inline: {}",
        ruby_quote(&format!(
            "mkdir -p /root/.ssh && echo '{}' | tee -a /root/.ssh/authorized_keys \
             >> /home/vagrant/.ssh/authorized_keys",
            public_key
        ))
    )
    .map_err(w)?;

    for vm in vms {
        writeln!(file).map_err(w)?;
        writeln!(file, "  config.vm.define {} do |node|", ruby_quote(&vm.name)).map_err(w)?;
        writeln!(file, "    node.vm.hostname = {}", ruby_quote(&vm.name)).map_err(w)?;
        writeln!(file, "    node.vm.network 'private_network', type: 'dhcp'").map_err(w)?;
        writeln!(file, "    node.vm.provider 'virtualbox' do |vb|").map_err(w)?;
        writeln!(file, "      vb.name = {}", ruby_quote(&vm.name)).map_err(w)?;
        writeln!(file, "      vb.memory = {}", config.memory_mb).map_err(w)?;
        writeln!(file, "      vb.cpus = {}", config.cpus).map_err(w)?;
        writeln!(
            file,
            "      vb.customize ['modifyvm', :id, '--description', {}]",
            ruby_quote(&encode_description(&vm.labels)?)
        )
        .map_err(w)?;
        writeln!(file, "    end").map_err(w)?;
        writeln!(file, "  end").map_err(w)?;
    }

    writeln!(file, "end").map_err(w)?;
    Ok(file)
}

/// `"name" {uuid}` lines of `VBoxManage list vms`
pub fn parse_vm_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (name, rest) = line.strip_prefix('"')?.split_once("\" {")?;
            let uuid = rest.strip_suffix('}')?;
            Some((name.to_string(), uuid.to_string()))
        })
        .collect()
}

/// The `description` value in `showvminfo --machinereadable` output
pub fn parse_description(showvminfo: &str) -> Option<String> {
    let line = showvminfo
        .lines()
        .find(|line| line.starts_with("description="))?;
    let quoted = line.trim_start_matches("description=");
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;

    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                value.push(escaped);
            }
        } else {
            value.push(c);
        }
    }
    Some(value)
}

/// Address in `VBoxManage guestproperty get` output
pub fn parse_guest_ip(output: &str) -> Option<IpAddr> {
    output.trim().strip_prefix("Value:")?.trim().parse().ok()
}

/// Thin wrapper over `VBoxManage`
#[derive(Debug, Clone)]
pub struct VBoxManage {
    binary: String,
}

impl VBoxManage {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// `(name, uuid)` of every VM
    pub async fn list_vms(&self) -> Result<Vec<(String, String)>> {
        let mut command = Command::new(&self.binary);
        command.args(["list", "vms"]);
        Ok(parse_vm_list(&exec::execute_stdout(&mut command).await?))
    }

    pub async fn labels(&self, vm: &str) -> Result<Option<BTreeMap<String, String>>> {
        let mut command = Command::new(&self.binary);
        command.args(["showvminfo", vm, "--machinereadable"]);
        let info = exec::execute_stdout(&mut command).await?;
        Ok(parse_description(&info).and_then(|d| decode_description(&d)))
    }

    pub async fn ip(&self, vm: &str) -> Result<Option<IpAddr>> {
        let mut command = Command::new(&self.binary);
        command.args(["guestproperty", "get", vm, IP_PROPERTY]);
        Ok(parse_guest_ip(&exec::execute_stdout(&mut command).await?))
    }

    /// `(vm name, labels)` of every VM labelled with `cluster_id`
    pub async fn cluster_vms(&self, cluster_id: &str) -> Result<Vec<(String, LabelSet)>> {
        let mut found = Vec::new();
        for (name, uuid) in self.list_vms().await? {
            let Some(labels) = self.labels(&uuid).await? else {
                continue;
            };
            if LabelSet::belongs_to(&labels, cluster_id) {
                found.push((name, LabelSet::from_map(&labels, &[])?));
            }
        }
        Ok(found)
    }
}

/// Creates clusters of VirtualBox VMs
#[derive(Debug, Clone, Default)]
pub struct VagrantBackend {
    config: VagrantConfig,
}

impl VagrantBackend {
    pub fn new(config: VagrantConfig) -> Self {
        Self { config }
    }

    fn vboxmanage(&self) -> VBoxManage {
        VBoxManage::new(&self.config.vboxmanage_binary)
    }

    async fn vagrant(&self, workspace: &Workspace, args: &[&str]) -> Result<()> {
        let mut command = Command::new(&self.config.vagrant_binary);
        command.args(args).current_dir(workspace.path());
        exec::execute(&mut command).await?;
        Ok(())
    }

    async fn wait_for_ip(&self, vbox: &VBoxManage, vm: &str) -> Result<IpAddr> {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), Duration::from_secs(120));
        wait_for_condition(&policy, ReadinessState::Installing, || async move {
            vbox.ip(vm).await?.ok_or(CondCheckError::NotYet)
        })
        .await
        .map_err(|e| E2eError::ResourceCreationFailed(format!("{} has no address: {}", vm, e)))
    }

    async fn collect_nodes(
        &self,
        vbox: &VBoxManage,
        vms: &[(String, LabelSet)],
    ) -> Result<(NodeGroups, BTreeMap<IpAddr, String>)> {
        let mut nodes = NodeGroups::default();
        let mut names = BTreeMap::new();
        for (name, labels) in vms {
            let ip = self.wait_for_ip(vbox, name).await?;
            let key = Workspace::open(&labels.workspace_dir).ssh_key_path();
            nodes
                .by_role_mut(labels.role)
                .insert(Node::new(ip, ip, key, "vagrant", NodeTransport::Ssh));
            names.insert(ip, name.clone());
        }
        Ok((nodes, names))
    }
}

#[async_trait]
impl ClusterBackend for VagrantBackend {
    async fn create(&self, spec: &ClusterSpec) -> Result<Box<dyn ClusterManager>> {
        let cluster_id = new_cluster_id();
        let workspace = Workspace::create(self.config.workspace_parent.as_deref(), &cluster_id)
            .await
            .map_err(|e| E2eError::ResourceCreationFailed(format!("workspace: {}", e)))?;

        let mut vms = Vec::new();
        for role in Role::ALL {
            for index in 0..spec.count(role) {
                let role_name = role.label_value().replace('_', "-");
                vms.push(VmDefinition {
                    name: format!("dcos-e2e-{}-{}-{}", cluster_id, role_name, index),
                    labels: LabelSet::new(&cluster_id, role, workspace.path())
                        .variant(spec.variant),
                });
            }
        }

        let vagrantfile = render_vagrantfile(
            &self.config,
            &vms,
            &workspace.public_key().await?,
            &workspace.ssh_key_path(),
        )?;
        tokio::fs::write(workspace.path().join("Vagrantfile"), vagrantfile).await?;

        info!(
            cluster_id = %cluster_id,
            vms = vms.len(),
            box_name = %self.config.box_name,
            "Creating VMs"
        );
        self.vagrant(&workspace, &["up"])
            .await
            .map_err(|e| E2eError::ResourceCreationFailed(e.to_string()))?;

        let vbox = self.vboxmanage();
        let vms: Vec<(String, LabelSet)> = vms.into_iter().map(|vm| (vm.name, vm.labels)).collect();
        let (nodes, names) = self.collect_nodes(&vbox, &vms).await?;

        Ok(Box::new(VagrantCluster {
            backend: self.clone(),
            cluster_id,
            nodes,
            names,
            workspace,
        }))
    }

    async fn rediscover(&self, cluster_id: &str) -> Result<Box<dyn ClusterManager>> {
        let vbox = self.vboxmanage();
        let vms = vbox.cluster_vms(cluster_id).await?;
        let workspace = vms
            .first()
            .map(|(_, labels)| Workspace::open(&labels.workspace_dir))
            .ok_or_else(|| cluster_not_found(cluster_id))?;
        debug!(cluster_id = %cluster_id, vms = vms.len(), "Found VMs");

        let (nodes, names) = self.collect_nodes(&vbox, &vms).await?;
        Ok(Box::new(VagrantCluster {
            backend: self.clone(),
            cluster_id: cluster_id.to_string(),
            nodes,
            names,
            workspace,
        }))
    }
}

/// A cluster of Vagrant-managed VMs
#[derive(Debug)]
pub struct VagrantCluster {
    backend: VagrantBackend,
    cluster_id: String,
    nodes: NodeGroups,
    /// VM name of each node
    names: BTreeMap<IpAddr, String>,
    workspace: Workspace,
}

#[async_trait]
impl ClusterManager for VagrantCluster {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn nodes(&self) -> &NodeGroups {
        &self.nodes
    }

    fn base_config(&self) -> Mapping {
        let mut config = common_config();
        config.insert("resolvers".into(), Value::Sequence(vec!["8.8.8.8".into()]));
        config
    }

    fn ip_detect_script(&self) -> &str {
        IP_DETECT
    }

    fn workspace_dir(&self) -> Option<&Path> {
        Some(self.workspace.path())
    }

    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        let name = self.names.get(&node.public_ip()).cloned().ok_or_else(|| {
            E2eError::NodeNotFound(format!("{} is not part of cluster {}", node, self.cluster_id))
        })?;
        self.backend
            .vagrant(&self.workspace, &["destroy", "--force", name.as_str()])
            .await?;
        self.names.remove(&node.public_ip());
        self.nodes.remove(node);
        info!(node = %node, vm = %name, "Destroyed VM");
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        self.backend
            .vagrant(&self.workspace, &["destroy", "--force"])
            .await?;
        self.workspace.remove().await?;
        self.nodes = NodeGroups::default();
        self.names.clear();
        info!(cluster_id = %self.cluster_id, "Destroyed VM cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::DcosVariant;
    use crate::labels;

    #[test]
    fn test_ruby_quote() {
        assert_eq!(ruby_quote("plain"), "'plain'");
        assert_eq!(ruby_quote("it's"), r"'it\'s'");
        assert_eq!(ruby_quote(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn test_parse_vm_list() {
        let output = "\"dcos-e2e-abc-master-0\" {0b9e8f6a-1111-2222-3333-444455556666}\n\
                      \"other vm\" {aaaa}\n\ngarbage\n";
        assert_eq!(
            parse_vm_list(output),
            vec![
                (
                    "dcos-e2e-abc-master-0".to_string(),
                    "0b9e8f6a-1111-2222-3333-444455556666".to_string()
                ),
                ("other vm".to_string(), "aaaa".to_string()),
            ]
        );
    }

    #[test]
    fn test_description_round_trip() {
        let labels =
            LabelSet::new("abc", Role::Agent, "/tmp/dcos-e2e-abc").variant(Some(DcosVariant::Oss));
        let description = encode_description(&labels).unwrap();

        // VBoxManage escapes quotes and backslashes in machine-readable output
        let escaped = description.replace('\\', "\\\\").replace('"', "\\\"");
        let showvminfo = format!(
            "name=\"dcos-e2e-abc-agent-0\"\ndescription=\"{}\"\nmemory=4096\n",
            escaped
        );

        let parsed = parse_description(&showvminfo).unwrap();
        let map = decode_description(&parsed).unwrap();
        assert_eq!(LabelSet::from_map(&map, &[]).unwrap(), labels);
        assert_eq!(map.get(labels::VARIANT).unwrap(), "");
    }

    #[test]
    fn test_foreign_descriptions() {
        assert_eq!(parse_description("name=\"x\"\n"), None);
        assert_eq!(decode_description("my test VM"), None);
    }

    #[test]
    fn test_parse_guest_ip() {
        assert_eq!(parse_guest_ip("Value: 172.28.128.3\n"), Some("172.28.128.3".parse().unwrap()));
        assert_eq!(parse_guest_ip("No value set!\n"), None);
    }

    #[test]
    fn test_render_vagrantfile() {
        let vms = vec![VmDefinition {
            name: "dcos-e2e-abc-master-0".to_string(),
            labels: LabelSet::new("abc", Role::Master, "/w"),
        }];
        let file = render_vagrantfile(
            &VagrantConfig::default().memory_mb(8192),
            &vms,
            "ssh-rsa AAAA key",
            Path::new("/w/ssh/id_rsa"),
        )
        .unwrap();

        assert!(file.starts_with("Vagrant.configure('2') do |config|\n"));
        assert!(file.contains("config.vm.define 'dcos-e2e-abc-master-0' do |node|"));
        assert!(file.contains("vb.memory = 8192"));
        let description = r#"{"cluster-id":"abc","node-type":"master","workspace-dir":"/w"}"#;
        assert!(file.contains(&format!("'--description', '{}'", description)));
        assert!(file.contains(r"echo \'ssh-rsa AAAA key\'"));
        assert!(file.trim_end().ends_with("end"));
    }
}
