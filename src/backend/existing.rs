//! Nodes this crate did not create
//!
//! Wraps machines provisioned elsewhere. Someone else owns them, so they
//! can be read and used but never destroyed from here.

use super::{common_config, ClusterManager};
use crate::error::{E2eError, Result};
use crate::node::{Node, NodeGroups};
use async_trait::async_trait;
use serde_yaml::Mapping;

/// Caller-supplied nodes
#[derive(Debug, Clone)]
pub struct ExistingNodes {
    cluster_id: String,
    nodes: NodeGroups,
}

impl ExistingNodes {
    pub fn new(cluster_id: &str, nodes: NodeGroups) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            nodes,
        }
    }
}

#[async_trait]
impl ClusterManager for ExistingNodes {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn nodes(&self) -> &NodeGroups {
        &self.nodes
    }

    fn base_config(&self) -> Mapping {
        common_config()
    }

    fn owns_resources(&self) -> bool {
        false
    }

    async fn destroy_node(&mut self, node: &Node) -> Result<()> {
        Err(E2eError::UnsupportedOperation(format!(
            "{} was not created by this cluster and cannot be destroyed",
            node
        )))
    }

    async fn destroy(&mut self) -> Result<()> {
        Err(E2eError::UnsupportedOperation(
            "clusters built from existing nodes cannot be destroyed".to_string(),
        ))
    }
}
