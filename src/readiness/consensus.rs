//! Leader consensus across masters
//!
//! Each master is asked who it believes leads a subsystem. A leader is only
//! accepted when every master gives the same answer in the same round.

use super::retry::{wait_for_condition, CondCheckError, RetryPolicy};
use super::ReadinessState;
use crate::error::{E2eError, Result};
use crate::node::Node;
use crate::transport::RunRequest;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// A cluster subsystem that elects a leader among the masters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subsystem {
    /// Resource manager
    Mesos,
    /// Coordination service, supervised by Exhibitor
    Zookeeper,
}

impl Subsystem {
    pub const ALL: [Subsystem; 2] = [Subsystem::Mesos, Subsystem::Zookeeper];

    /// Endpoint on a master that reports its view of the leader
    pub fn opinion_url(&self, master: IpAddr) -> String {
        let host = match master {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        self.url_on(&host)
    }

    /// The same endpoint as seen from the master itself
    pub fn local_url(&self) -> String {
        self.url_on("localhost")
    }

    fn url_on(&self, host: &str) -> String {
        match self {
            Subsystem::Mesos => format!("https://{}:5050/master/state", host),
            Subsystem::Zookeeper => {
                format!("https://{}:8181/exhibitor/v1/cluster/status", host)
            }
        }
    }

    /// Extract the leader's address from an opinion endpoint's body
    pub fn parse_opinion(&self, body: &str) -> Result<String> {
        match self {
            Subsystem::Mesos => {
                let state: MesosState = serde_json::from_str(body)?;
                parse_mesos_leader(&state.leader)
            }
            Subsystem::Zookeeper => {
                let members: Vec<ExhibitorMember> = serde_json::from_str(body)?;
                members
                    .into_iter()
                    .find(|member| member.is_leader)
                    .map(|member| member.hostname)
                    .ok_or_else(|| E2eError::Http("no exhibitor member is leader".to_string()))
            }
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::Mesos => write!(f, "mesos"),
            Subsystem::Zookeeper => write!(f, "zookeeper"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MesosState {
    #[serde(default)]
    leader: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExhibitorMember {
    hostname: String,
    #[serde(default)]
    is_leader: bool,
}

/// `master@10.0.0.1:5050` -> `10.0.0.1`
fn parse_mesos_leader(leader: &str) -> Result<String> {
    let address = leader
        .split_once('@')
        .map(|(_, address)| address)
        .ok_or_else(|| E2eError::Http(format!("mesos reports no leader ({:?})", leader)))?;
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

/// Where a master's opinion of a leader comes from
#[async_trait]
pub trait OpinionSource: Send + Sync {
    /// The leader `master` believes in. Errors when the master cannot say.
    async fn opinion(&self, subsystem: Subsystem, master: &Node) -> Result<String>;
}

/// Asks each master's HTTPS endpoints directly
pub struct HttpOpinionSource {
    client: reqwest::Client,
}

impl HttpOpinionSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| E2eError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OpinionSource for HttpOpinionSource {
    async fn opinion(&self, subsystem: Subsystem, master: &Node) -> Result<String> {
        let url = subsystem.opinion_url(master.public_ip());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| E2eError::Http(format!("{}: {}", url, e)))?;
        let body = response
            .text()
            .await
            .map_err(|e| E2eError::Http(e.to_string()))?;
        subsystem.parse_opinion(&body)
    }
}

/// Asks each master through its own transport, for hosts that cannot route
/// HTTP to the cluster
pub struct NodeOpinionSource {
    timeout: Duration,
}

impl NodeOpinionSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl OpinionSource for NodeOpinionSource {
    async fn opinion(&self, subsystem: Subsystem, master: &Node) -> Result<String> {
        let max_time = self.timeout.as_secs().max(1).to_string();
        let url = subsystem.local_url();
        let request = RunRequest::new([
            "curl",
            "--fail",
            "--silent",
            "--show-error",
            "--insecure",
            "--max-time",
            max_time.as_str(),
            url.as_str(),
        ])
        .timeout(self.timeout + Duration::from_secs(5));
        let output = master.run(&request).await?;
        subsystem.parse_opinion(&output.stdout)
    }
}

/// The single leader all opinions agree on, if they do
pub fn consensus<I, S>(opinions: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let distinct: BTreeSet<String> = opinions.into_iter().map(Into::into).collect();
    if distinct.len() == 1 {
        distinct.into_iter().next()
    } else {
        None
    }
}

/// Ask every master once and judge agreement on that round alone.
///
/// A master that cannot answer means there is no consensus this round.
pub async fn poll_consensus(
    source: &dyn OpinionSource,
    subsystem: Subsystem,
    masters: &BTreeSet<Node>,
) -> Option<String> {
    let round = join_all(masters.iter().map(|master| source.opinion(subsystem, master))).await;

    let mut opinions = Vec::with_capacity(round.len());
    for (master, opinion) in masters.iter().zip(round) {
        match opinion {
            Ok(leader) => opinions.push(leader),
            Err(err) => {
                debug!(node = %master, subsystem = %subsystem, "No opinion: {}", err);
                return None;
            }
        }
    }

    let leader = consensus(opinions.iter().cloned());
    if leader.is_none() {
        debug!(subsystem = %subsystem, "Masters disagree: {:?}", opinions);
    }
    leader
}

/// Poll until all masters agree on a leader for `subsystem`
pub async fn wait_for_leader(
    source: &dyn OpinionSource,
    subsystem: Subsystem,
    masters: &BTreeSet<Node>,
    policy: &RetryPolicy,
) -> Result<String> {
    let leader = wait_for_condition(policy, ReadinessState::WaitingForConsensus, || async move {
        poll_consensus(source, subsystem, masters)
            .await
            .ok_or(CondCheckError::NotYet)
    })
    .await?;

    info!(subsystem = %subsystem, leader = %leader, "Masters agree on leader");
    Ok(leader)
}
