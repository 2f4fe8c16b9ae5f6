//! DC/OS `config.yaml` handling

use crate::error::Result;
use crate::node::NodeGroups;
use serde_yaml::{Mapping, Value};

/// Merge `overrides` into `base`. Keys in `overrides` win.
pub fn merge(base: &Mapping, overrides: &Mapping) -> Mapping {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Add `master_list`, `agent_list` and `public_agent_list` from the nodes'
/// private IPs
pub fn with_node_lists(config: &Mapping, nodes: &NodeGroups) -> Mapping {
    let ips = |set: &std::collections::BTreeSet<crate::node::Node>| {
        Value::Sequence(
            set.iter()
                .map(|node| Value::String(node.private_ip().to_string()))
                .collect(),
        )
    };

    let mut config = config.clone();
    config.insert("master_list".into(), ips(&nodes.masters));
    config.insert("agent_list".into(), ips(&nodes.agents));
    config.insert("public_agent_list".into(), ips(&nodes.public_agents));
    config
}

/// Serialize a config for `/genconf/config.yaml`
pub fn to_yaml(config: &Mapping) -> Result<String> {
    Ok(serde_yaml::to_string(config)?)
}

/// Parse a YAML document into a config mapping. An empty document is an
/// empty config.
pub fn from_yaml_str(yaml: &str) -> Result<Mapping> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

/// Build a config from string pairs
pub fn mapping<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Mapping {
    pairs
        .into_iter()
        .map(|(k, v)| (Value::String(k.to_string()), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::transport::NodeTransport;
    use std::path::PathBuf;

    #[test]
    fn test_overrides_win() {
        let base = from_yaml_str("cluster_name: base\nresolvers: [8.8.8.8]\n").unwrap();
        let overrides = from_yaml_str("cluster_name: mine\noauth_enabled: false\n").unwrap();

        let merged = merge(&base, &overrides);
        assert_eq!(merged.get("cluster_name").unwrap(), "mine");
        assert_eq!(merged.get("oauth_enabled").unwrap(), &Value::Bool(false));
        assert!(merged.contains_key("resolvers"));
        assert_eq!(base.get("cluster_name").unwrap(), "base");
    }

    #[test]
    fn test_empty_document() {
        assert!(from_yaml_str("").unwrap().is_empty());
        assert!(from_yaml_str("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_node_lists() {
        let node = |ip: &str| {
            Node::new(
                "1.1.1.1".parse().unwrap(),
                ip.parse().unwrap(),
                PathBuf::from("/k"),
                "root",
                NodeTransport::Ssh,
            )
        };
        let mut nodes = NodeGroups::default();
        nodes.masters.insert(node("10.0.0.1"));
        nodes.agents.insert(node("10.0.0.2"));

        let config = with_node_lists(&Mapping::new(), &nodes);
        let yaml = to_yaml(&config).unwrap();
        assert!(yaml.contains("master_list:\n- 10.0.0.1"));
        assert!(yaml.contains("public_agent_list: []"));
    }

    #[test]
    fn test_mapping_helper() {
        let config = mapping([("check_time", Value::Bool(false))]);
        assert_eq!(config.get("check_time").unwrap(), &Value::Bool(false));
    }
}
