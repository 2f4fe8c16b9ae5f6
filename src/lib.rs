//! dcos-e2e - Spin up and manage DC/OS clusters for end to end testing
//!
//! dcos-e2e creates throwaway multi-node DC/OS clusters and drives them from
//! test code. It provides:
//!
//! - Cluster creation on Docker containers, AWS EC2 instances or Vagrant VMs
//! - Installation and upgrade of open source and Enterprise DC/OS
//! - Waiting for a cluster to be ready through leader consensus
//! - Running commands on nodes over SSH or `docker exec`
//! - Rediscovering and destroying clusters created by another process

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod installer;
pub mod labels;
pub mod logging;
pub mod node;
pub mod readiness;
pub mod transport;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use backend::{ClusterBackend, ClusterManager, ClusterSpec, Distribution};
pub use cluster::Cluster;
pub use error::{E2eError, Result};
pub use installer::{DcosVariant, VariantChoice};
pub use node::{Node, NodeGroups, Role};
pub use readiness::{ReadinessOptions, ReadinessReport};
pub use transport::{CommandOutput, NodeTransport, Output, RunRequest};
