//! EC2 backend
//!
//! Drives the `aws` command line. Every instance, plus the cluster's key
//! pair and security group, is named after the cluster ID, and instances
//! carry the label schema as EC2 tags.

use super::{
    cluster_not_found, common_config, new_cluster_id, ClusterBackend, ClusterManager, ClusterSpec,
    Distribution,
};
use crate::error::{E2eError, Result};
use crate::exec;
use crate::labels::{self, LabelSet};
use crate::node::{Node, NodeGroups, Role};
use crate::readiness::{wait_for_condition, CondCheckError, ReadinessState, RetryPolicy};
use crate::transport::NodeTransport;
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Tag holding the ID of the cluster's security group
pub const SECURITY_GROUP_ID: &str = "security-group-id";

const PROVIDER_TAGS: [&str; 3] = [labels::SSH_USER, labels::KEY_PAIR_NAME, SECURITY_GROUP_ID];

const IP_DETECT: &str = r#"#!/bin/sh
set -o nounset -o errexit
curl -fsSL http://169.254.169.254/latest/meta-data/local-ipv4
"#;

/// Options for the EC2 backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub aws_binary: String,
    pub region: String,
    pub instance_type: String,
    pub distribution: Distribution,
    /// Machine image per distribution for `region`
    pub amis: HashMap<Distribution, String>,
    /// CIDR allowed to reach the nodes
    pub admin_location: String,
    /// Login user per distribution, overriding the distribution's default
    pub ssh_users: HashMap<Distribution, String>,
    /// Extra tags for every instance
    pub tags: BTreeMap<String, String>,
    pub workspace_parent: Option<PathBuf>,
    /// How long to wait for new instances to get addresses
    pub address_timeout: Duration,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            aws_binary: "aws".to_string(),
            region: "us-west-2".to_string(),
            instance_type: "m4.large".to_string(),
            distribution: Distribution::default(),
            amis: HashMap::new(),
            admin_location: "0.0.0.0/0".to_string(),
            ssh_users: HashMap::new(),
            tags: BTreeMap::new(),
            workspace_parent: None,
            address_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl AwsConfig {
    pub fn region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn instance_type(mut self, instance_type: &str) -> Self {
        self.instance_type = instance_type.to_string();
        self
    }

    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn ami(mut self, distribution: Distribution, ami: &str) -> Self {
        self.amis.insert(distribution, ami.to_string());
        self
    }

    pub fn admin_location(mut self, cidr: &str) -> Self {
        self.admin_location = cidr.to_string();
        self
    }

    pub fn ssh_user(mut self, distribution: Distribution, user: &str) -> Self {
        self.ssh_users.insert(distribution, user.to_string());
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn workspace_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.workspace_parent = Some(parent.into());
        self
    }

    pub fn ssh_user_for(&self, distribution: Distribution) -> String {
        self.ssh_users
            .get(&distribution)
            .cloned()
            .unwrap_or_else(|| distribution.default_ssh_user().to_string())
    }

    fn ami_for(&self, distribution: Distribution) -> Result<&str> {
        self.amis.get(&distribution).map(String::as_str).ok_or_else(|| {
            E2eError::InvalidConfig(format!(
                "no AMI configured for {} in {}",
                distribution, self.region
            ))
        })
    }
}

/// One EC2 tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Subset of an EC2 instance description
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Instance {
    pub instance_id: String,
    #[serde(default)]
    pub public_ip_address: Option<IpAddr>,
    #[serde(default)]
    pub private_ip_address: Option<IpAddr>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Instance {
    pub fn tag_map(&self) -> BTreeMap<String, String> {
        tags_to_map(&self.tags)
    }

    /// Both addresses, once the instance has them
    pub fn addresses(&self) -> Option<(IpAddr, IpAddr)> {
        Some((self.public_ip_address?, self.private_ip_address?))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateSecurityGroup {
    group_id: String,
}

pub fn map_to_tags(map: &BTreeMap<String, String>) -> Vec<Tag> {
    map.iter()
        .map(|(key, value)| Tag {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

pub fn tags_to_map(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|tag| (tag.key.clone(), tag.value.clone()))
        .collect()
}

/// `--tag-specifications` value tagging new instances with `tags`
fn tag_specification(tags: &[Tag]) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!([
        { "ResourceType": "instance", "Tags": tags }
    ]))?)
}

/// Thin wrapper over `aws ec2`
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
    region: String,
}

impl AwsCli {
    pub fn new(binary: &str, region: &str) -> Self {
        Self {
            binary: binary.to_string(),
            region: region.to_string(),
        }
    }

    fn ec2(&self, subcommand: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(["--region", self.region.as_str(), "--output", "json", "ec2", subcommand]);
        command
    }

    pub async fn import_key_pair(&self, name: &str, public_key: &Path) -> Result<()> {
        let mut command = self.ec2("import-key-pair");
        command
            .args(["--key-name", name, "--public-key-material"])
            .arg(format!("fileb://{}", public_key.display()));
        exec::execute(&mut command).await?;
        Ok(())
    }

    pub async fn delete_key_pair(&self, name: &str) -> Result<()> {
        let mut command = self.ec2("delete-key-pair");
        command.args(["--key-name", name]);
        exec::execute(&mut command).await?;
        Ok(())
    }

    pub async fn create_security_group(&self, name: &str, admin_location: &str) -> Result<String> {
        let mut command = self.ec2("create-security-group");
        command.args(["--group-name", name, "--description", "DC/OS E2E cluster"]);
        let created: CreateSecurityGroup =
            serde_json::from_str(&exec::execute_stdout(&mut command).await?)?;

        let mut from_admin = self.ec2("authorize-security-group-ingress");
        from_admin.args([
            "--group-id",
            created.group_id.as_str(),
            "--protocol",
            "all",
            "--cidr",
            admin_location,
        ]);
        exec::execute(&mut from_admin).await?;

        let mut within_group = self.ec2("authorize-security-group-ingress");
        within_group.args([
            "--group-id",
            created.group_id.as_str(),
            "--protocol",
            "all",
            "--source-group",
            created.group_id.as_str(),
        ]);
        exec::execute(&mut within_group).await?;

        Ok(created.group_id)
    }

    pub async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        let mut command = self.ec2("delete-security-group");
        command.args(["--group-id", group_id]);
        exec::execute(&mut command).await?;
        Ok(())
    }

    /// Launch `count` instances and return their IDs
    pub async fn run_instances(
        &self,
        ami: &str,
        instance_type: &str,
        count: usize,
        key_name: &str,
        security_group: &str,
        tags: &[Tag],
    ) -> Result<Vec<String>> {
        let count = count.to_string();
        let mut command = self.ec2("run-instances");
        command
            .args([
                "--image-id",
                ami,
                "--instance-type",
                instance_type,
                "--count",
                count.as_str(),
                "--key-name",
                key_name,
                "--security-group-ids",
                security_group,
                "--tag-specifications",
            ])
            .arg(tag_specification(tags)?);
        let launched: RunInstances =
            serde_json::from_str(&exec::execute_stdout(&mut command).await?)?;
        Ok(launched.instances.into_iter().map(|i| i.instance_id).collect())
    }

    /// Live instances tagged with `cluster_id`
    pub async fn cluster_instances(&self, cluster_id: &str) -> Result<Vec<Instance>> {
        let mut command = self.ec2("describe-instances");
        command
            .arg("--filters")
            .arg(format!("Name=tag:{},Values={}", labels::CLUSTER_ID, cluster_id))
            .arg("Name=instance-state-name,Values=pending,running,stopping,stopped");
        parse_describe_instances(&exec::execute_stdout(&mut command).await?)
    }

    pub async fn describe_instances(&self, ids: &[String]) -> Result<Vec<Instance>> {
        let mut command = self.ec2("describe-instances");
        command.arg("--instance-ids").args(ids);
        parse_describe_instances(&exec::execute_stdout(&mut command).await?)
    }

    pub async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut command = self.ec2("terminate-instances");
        command.arg("--instance-ids").args(ids);
        exec::execute(&mut command).await?;

        let mut wait = self.ec2("wait");
        wait.arg("instance-terminated").arg("--instance-ids").args(ids);
        exec::execute(&mut wait).await?;
        Ok(())
    }
}

fn parse_describe_instances(stdout: &str) -> Result<Vec<Instance>> {
    let described: DescribeInstances = serde_json::from_str(stdout)?;
    Ok(described
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .collect())
}

/// Search domain of the VPC resolver in `region`
pub fn dns_search(region: &str) -> String {
    if region == "us-east-1" {
        "ec2.internal".to_string()
    } else {
        format!("{}.compute.internal", region)
    }
}

/// Creates clusters of EC2 instances
#[derive(Debug, Clone, Default)]
pub struct AwsBackend {
    config: AwsConfig,
}

impl AwsBackend {
    pub fn new(config: AwsConfig) -> Self {
        Self { config }
    }

    fn cli(&self) -> AwsCli {
        AwsCli::new(&self.config.aws_binary, &self.config.region)
    }

    /// Wait until every instance has a public and a private address
    async fn wait_for_addresses(&self, cli: &AwsCli, ids: &[String]) -> Result<Vec<Instance>> {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), self.config.address_timeout);
        wait_for_condition(&policy, ReadinessState::Installing, || async move {
            let instances = cli.describe_instances(ids).await?;
            let pending = instances.iter().filter(|i| i.addresses().is_none()).count();
            if pending > 0 || instances.len() < ids.len() {
                debug!(pending, "Waiting for instance addresses");
                return Err(CondCheckError::NotYet);
            }
            Ok(instances)
        })
        .await
        .map_err(|e| match e {
            E2eError::ReadinessTimeout { elapsed, .. } => E2eError::ResourceCreationFailed(format!(
                "instances did not get addresses within {:?}",
                elapsed
            )),
            other => other,
        })
    }

    fn node_for(&self, instance: &Instance, labels: &LabelSet) -> Result<Node> {
        let (public_ip, private_ip) = instance.addresses().ok_or_else(|| {
            E2eError::NodeNotFound(format!("instance {} has no addresses", instance.instance_id))
        })?;
        let user = labels
            .extra
            .get(labels::SSH_USER)
            .cloned()
            .unwrap_or_else(|| self.config.ssh_user_for(self.config.distribution));
        let workspace = Workspace::open(&labels.workspace_dir);
        Ok(Node::new(
            public_ip,
            private_ip,
            workspace.ssh_key_path(),
            &user,
            NodeTransport::Ssh,
        ))
    }

    async fn launch(
        &self,
        cli: &AwsCli,
        cluster_id: &str,
        workspace: &Workspace,
        spec: &ClusterSpec,
    ) -> Result<AwsCluster> {
        let ami = self.config.ami_for(self.config.distribution)?;
        let key_name = format!("dcos-e2e-{}", cluster_id);
        let ssh_user = self.config.ssh_user_for(self.config.distribution);

        cli.import_key_pair(&key_name, &workspace.public_key_path()).await?;
        let security_group = cli
            .create_security_group(&key_name, &self.config.admin_location)
            .await?;

        let mut nodes = NodeGroups::default();
        for role in Role::ALL {
            let count = spec.count(role);
            if count == 0 {
                continue;
            }

            let labels = LabelSet::new(cluster_id, role, workspace.path())
                .variant(spec.variant)
                .extra(labels::SSH_USER, &ssh_user)
                .extra(labels::KEY_PAIR_NAME, &key_name)
                .extra(SECURITY_GROUP_ID, &security_group);
            let mut tags = self.config.tags.clone();
            tags.extend(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            tags.extend(labels.to_map());
            tags.insert("Name".to_string(), format!("dcos-e2e-{}-{}", cluster_id, role));

            let ids = cli
                .run_instances(
                    ami,
                    &self.config.instance_type,
                    count,
                    &key_name,
                    &security_group,
                    &map_to_tags(&tags),
                )
                .await?;
            info!(role = %role, instances = ?ids, "Launched instances");

            for instance in self.wait_for_addresses(cli, &ids).await? {
                nodes.by_role_mut(role).insert(self.node_for(&instance, &labels)?);
            }
        }

        Ok(AwsCluster {
            cluster_id: cluster_id.to_string(),
            nodes,
            workspace: workspace.clone(),
            cli: cli.clone(),
            key_name,
            security_group: Some(security_group),
            region: self.config.region.clone(),
        })
    }
}

#[async_trait]
impl ClusterBackend for AwsBackend {
    async fn create(&self, spec: &ClusterSpec) -> Result<Box<dyn ClusterManager>> {
        let cli = self.cli();
        let cluster_id = new_cluster_id();
        let workspace = Workspace::create(self.config.workspace_parent.as_deref(), &cluster_id)
            .await
            .map_err(|e| E2eError::ResourceCreationFailed(format!("workspace: {}", e)))?;

        info!(
            cluster_id = %cluster_id,
            region = %self.config.region,
            distribution = %self.config.distribution,
            "Creating EC2 cluster"
        );
        let cluster = self
            .launch(&cli, &cluster_id, &workspace, spec)
            .await
            .map_err(|e| match e {
                E2eError::ResourceCreationFailed(_) => e,
                other => E2eError::ResourceCreationFailed(other.to_string()),
            })?;
        Ok(Box::new(cluster))
    }

    async fn rediscover(&self, cluster_id: &str) -> Result<Box<dyn ClusterManager>> {
        let cli = self.cli();
        let instances = cli.cluster_instances(cluster_id).await?;

        let mut nodes = NodeGroups::default();
        let mut found = None;
        for instance in &instances {
            let labels = LabelSet::from_map(&instance.tag_map(), &PROVIDER_TAGS)?;
            nodes.by_role_mut(labels.role).insert(self.node_for(instance, &labels)?);
            found = Some(labels);
        }
        let labels = found.ok_or_else(|| cluster_not_found(cluster_id))?;

        Ok(Box::new(AwsCluster {
            cluster_id: cluster_id.to_string(),
            nodes,
            workspace: Workspace::open(&labels.workspace_dir),
            cli,
            key_name: labels
                .extra
                .get(labels::KEY_PAIR_NAME)
                .cloned()
                .unwrap_or_else(|| format!("dcos-e2e-{}", cluster_id)),
            security_group: labels.extra.get(SECURITY_GROUP_ID).cloned(),
            region: self.config.region.clone(),
        }))
    }
}

/// A cluster of EC2 instances
#[derive(Debug)]
pub struct AwsCluster {
    cluster_id: String,
    nodes: NodeGroups,
    workspace: Workspace,
    cli: AwsCli,
    key_name: String,
    security_group: Option<String>,
    region: String,
}

#[async_trait]
impl ClusterManager for AwsCluster {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn nodes(&self) -> &NodeGroups {
        &self.nodes
    }

    fn base_config(&self) -> Mapping {
        let mut config = common_config();
        config.insert("resolvers".into(), Value::Sequence(vec!["169.254.169.253".into()]));
        config.insert("dns_search".into(), Value::from(dns_search(&self.region)));
        config
    }

    fn ip_detect_script(&self) -> &str {
        IP_DETECT
    }

    fn workspace_dir(&self) -> Option<&Path> {
        Some(self.workspace.path())
    }

    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        let instances = self.cli.cluster_instances(&self.cluster_id).await?;
        let instance = instances
            .iter()
            .find(|i| i.public_ip_address == Some(node.public_ip()))
            .ok_or_else(|| {
                E2eError::NodeNotFound(format!(
                    "{} is not part of cluster {}",
                    node, self.cluster_id
                ))
            })?;
        self.cli
            .terminate_instances(std::slice::from_ref(&instance.instance_id))
            .await?;
        self.nodes.remove(node);
        info!(node = %node, instance = %instance.instance_id, "Terminated instance");
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        let ids: Vec<String> = self
            .cli
            .cluster_instances(&self.cluster_id)
            .await?
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        self.cli.terminate_instances(&ids).await?;
        if let Some(group) = self.security_group.take() {
            self.cli.delete_security_group(&group).await?;
        }
        self.cli.delete_key_pair(&self.key_name).await?;
        self.workspace.remove().await?;
        self.nodes = NodeGroups::default();
        info!(cluster_id = %self.cluster_id, instances = ids.len(), "Destroyed EC2 cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::DcosVariant;

    const DESCRIBE: &str = r#"{
        "Reservations": [
            {
                "Instances": [
                    {
                        "InstanceId": "i-0abc",
                        "PublicIpAddress": "54.1.2.3",
                        "PrivateIpAddress": "172.31.0.10",
                        "State": {"Name": "running"},
                        "Tags": [
                            {"Key": "cluster-id", "Value": "abc"},
                            {"Key": "node-type", "Value": "master"},
                            {"Key": "workspace-dir", "Value": "/tmp/dcos-e2e-abc"},
                            {"Key": "ssh-user", "Value": "centos"},
                            {"Key": "key-pair-name", "Value": "dcos-e2e-abc"},
                            {"Key": "Name", "Value": "dcos-e2e-abc-master"}
                        ]
                    }
                ]
            },
            {
                "Instances": [
                    {
                        "InstanceId": "i-0def",
                        "PrivateIpAddress": "172.31.0.11",
                        "State": {"Name": "pending"}
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_describe_instances() {
        let instances = parse_describe_instances(DESCRIBE).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(
            instances[0].addresses(),
            Some(("54.1.2.3".parse().unwrap(), "172.31.0.10".parse().unwrap()))
        );
        assert_eq!(instances[1].addresses(), None);
        assert!(instances[1].tags.is_empty());
    }

    #[test]
    fn test_tags_round_trip_through_labels() {
        let labels = LabelSet::new("abc", Role::PublicAgent, "/tmp/dcos-e2e-abc")
            .variant(Some(DcosVariant::Enterprise))
            .extra(labels::SSH_USER, "core")
            .extra(labels::KEY_PAIR_NAME, "dcos-e2e-abc")
            .extra(SECURITY_GROUP_ID, "sg-123");

        let tags = map_to_tags(&labels.to_map());
        let decoded = LabelSet::from_map(&tags_to_map(&tags), &PROVIDER_TAGS).unwrap();
        assert_eq!(decoded, labels);
    }

    #[test]
    fn test_node_from_instance() {
        let backend = AwsBackend::default();
        let instance = &parse_describe_instances(DESCRIBE).unwrap()[0];
        let labels = LabelSet::from_map(&instance.tag_map(), &PROVIDER_TAGS).unwrap();

        let node = backend.node_for(instance, &labels).unwrap();
        assert_eq!(node.public_ip(), "54.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(node.private_ip(), "172.31.0.10".parse::<IpAddr>().unwrap());
        assert_eq!(node.default_user(), "centos");
        assert_eq!(node.ssh_key_path(), Path::new("/tmp/dcos-e2e-abc/ssh/id_rsa"));
    }

    #[test]
    fn test_tag_specification() {
        let spec = tag_specification(&[Tag {
            key: "cluster-id".to_string(),
            value: "abc".to_string(),
        }])
        .unwrap();
        assert_eq!(
            spec,
            r#"[{"ResourceType":"instance","Tags":[{"Key":"cluster-id","Value":"abc"}]}]"#
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = AwsConfig::default().ssh_user(Distribution::Rhel7, "cloud-user");
        assert_eq!(config.ssh_user_for(Distribution::Centos7), "centos");
        assert_eq!(config.ssh_user_for(Distribution::Rhel7), "cloud-user");
        assert!(config.ami_for(Distribution::Centos7).is_err());
        let config = config.ami(Distribution::Centos7, "ami-123");
        assert_eq!(config.ami_for(Distribution::Centos7).unwrap(), "ami-123");
    }

    #[test]
    fn test_dns_search() {
        assert_eq!(dns_search("us-east-1"), "ec2.internal");
        assert_eq!(dns_search("eu-west-1"), "eu-west-1.compute.internal");
    }
}
