//! Resource identity labels
//!
//! Every container, instance, or VM a backend creates carries the same set of
//! labels. They are the only record of which cluster a resource belongs to,
//! so every driver encodes and decodes them through [`LabelSet`] and these
//! key names.

use crate::error::{E2eError, Result};
use crate::installer::DcosVariant;
use crate::node::Role;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// ID of the cluster the resource belongs to
pub const CLUSTER_ID: &str = "cluster-id";
/// Role of the node: `master`, `agent` or `public_agent`
pub const NODE_TYPE: &str = "node-type";
/// Host workspace directory holding the cluster's SSH key
pub const WORKSPACE_DIR: &str = "workspace-dir";
/// DC/OS variant: `""` for OSS, `"ee"` for Enterprise
pub const VARIANT: &str = "variant";
/// Login user (cloud instances)
pub const SSH_USER: &str = "ssh-user";
/// Provider key pair name (cloud instances)
pub const KEY_PAIR_NAME: &str = "key-pair-name";

/// Keys owned by [`LabelSet`] itself
const RESERVED: [&str; 4] = [CLUSTER_ID, NODE_TYPE, WORKSPACE_DIR, VARIANT];

/// Labels attached to one cluster resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    pub cluster_id: String,
    pub role: Role,
    pub workspace_dir: PathBuf,
    /// Unknown until an installer has been inspected
    pub variant: Option<DcosVariant>,
    /// Provider-specific labels such as [`SSH_USER`]
    pub extra: BTreeMap<String, String>,
}

impl LabelSet {
    pub fn new(cluster_id: &str, role: Role, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            role,
            workspace_dir: workspace_dir.into(),
            variant: None,
            extra: BTreeMap::new(),
        }
    }

    /// Record the DC/OS variant
    pub fn variant(mut self, variant: Option<DcosVariant>) -> Self {
        self.variant = variant;
        self
    }

    /// Add a provider-specific label
    pub fn extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    /// Flatten into key/value pairs
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(CLUSTER_ID.to_string(), self.cluster_id.clone());
        map.insert(NODE_TYPE.to_string(), self.role.label_value().to_string());
        map.insert(
            WORKSPACE_DIR.to_string(),
            self.workspace_dir.to_string_lossy().into_owned(),
        );
        if let Some(variant) = self.variant {
            map.insert(VARIANT.to_string(), variant.installer_variant().to_string());
        }
        map
    }

    /// Read labels back from a resource.
    ///
    /// Unrelated keys on the resource are ignored unless listed in
    /// `extra_keys`.
    pub fn from_map(map: &BTreeMap<String, String>, extra_keys: &[&str]) -> Result<Self> {
        let required = |key: &str| {
            map.get(key)
                .cloned()
                .ok_or_else(|| E2eError::InvalidConfig(format!("resource has no {} label", key)))
        };

        let variant = match map.get(VARIANT) {
            Some(value) => Some(
                DcosVariant::from_installer_variant(value).map_err(|_| {
                    E2eError::InvalidConfig(format!("bad variant label {:?}", value))
                })?,
            ),
            None => None,
        };

        let extra = extra_keys
            .iter()
            .filter(|key| !RESERVED.contains(*key))
            .filter_map(|key| map.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();

        Ok(Self {
            cluster_id: required(CLUSTER_ID)?,
            role: required(NODE_TYPE)?.parse()?,
            workspace_dir: PathBuf::from(required(WORKSPACE_DIR)?),
            variant,
            extra,
        })
    }

    /// Whether a resource's labels say it belongs to `cluster_id`
    pub fn belongs_to(map: &BTreeMap<String, String>, cluster_id: &str) -> bool {
        map.get(CLUSTER_ID).map(String::as_str) == Some(cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let labels = LabelSet::new("abc123", Role::PublicAgent, "/tmp/dcos-e2e-abc123")
            .variant(Some(DcosVariant::Enterprise))
            .extra(SSH_USER, "centos");

        let map = labels.to_map();
        assert_eq!(map.get(NODE_TYPE).unwrap(), "public_agent");
        assert_eq!(map.get(VARIANT).unwrap(), "ee");

        let decoded = LabelSet::from_map(&map, &[SSH_USER]).unwrap();
        assert_eq!(decoded, labels);
    }

    #[test]
    fn test_variant_is_optional() {
        let labels = LabelSet::new("abc", Role::Master, "/w");
        let map = labels.to_map();
        assert!(!map.contains_key(VARIANT));
        assert_eq!(LabelSet::from_map(&map, &[]).unwrap().variant, None);

        let mut oss = map.clone();
        oss.insert(VARIANT.to_string(), String::new());
        assert_eq!(
            LabelSet::from_map(&oss, &[]).unwrap().variant,
            Some(DcosVariant::Oss)
        );
    }

    #[test]
    fn test_missing_and_bad_labels() {
        let mut map = LabelSet::new("abc", Role::Agent, "/w").to_map();
        map.remove(WORKSPACE_DIR);
        assert!(LabelSet::from_map(&map, &[]).is_err());

        let mut map = LabelSet::new("abc", Role::Agent, "/w").to_map();
        map.insert(NODE_TYPE.to_string(), "bootstrap".to_string());
        assert!(LabelSet::from_map(&map, &[]).is_err());
    }

    #[test]
    fn test_unrelated_keys_are_ignored() {
        let mut map = LabelSet::new("abc", Role::Agent, "/w").to_map();
        map.insert("maintainer".to_string(), "someone".to_string());
        let decoded = LabelSet::from_map(&map, &[]).unwrap();
        assert!(decoded.extra.is_empty());
        assert!(LabelSet::belongs_to(&map, "abc"));
        assert!(!LabelSet::belongs_to(&map, "abd"));
    }
}
