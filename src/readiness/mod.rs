//! Deciding when an installed cluster is usable
//!
//! Readiness moves through
//! `Installing -> WaitingForBuildManifest -> WaitingForConsensus ->
//! WaitingForHttp -> Ready`. The HTTP step is skipped when the caller cannot
//! route HTTP to the cluster. Running out of time in any state ends in
//! `TimedOut`, reported as [`E2eError::ReadinessTimeout`].

pub mod consensus;
pub mod http;
pub mod retry;

pub use consensus::{
    consensus, poll_consensus, wait_for_leader, HttpOpinionSource, NodeOpinionSource,
    OpinionSource, Subsystem,
};
pub use http::{Credentials, HealthCheck, HttpHealthCheck};
pub use retry::{wait_for_condition, CondCheckError, RetryPolicy};

use crate::error::{E2eError, Result};
use crate::installer::DcosVariant;
use crate::node::{BuildInfo, Node, NodeGroups};
use crate::transport::NodeTransport;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timeout for one HTTP request to a master
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a cluster is on its way to being usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadinessState {
    Installing,
    WaitingForBuildManifest,
    WaitingForConsensus,
    WaitingForHttp,
    Ready,
    TimedOut,
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessState::Installing => write!(f, "installing"),
            ReadinessState::WaitingForBuildManifest => write!(f, "waiting for build manifest"),
            ReadinessState::WaitingForConsensus => write!(f, "waiting for consensus"),
            ReadinessState::WaitingForHttp => write!(f, "waiting for HTTP checks"),
            ReadinessState::Ready => write!(f, "ready"),
            ReadinessState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Knobs for [`ReadinessEngine::wait_for_ready`]
#[derive(Debug, Clone)]
pub struct ReadinessOptions {
    /// Check the public HTTP surface after consensus
    pub http_checks: bool,
    /// Variant to check for; read from the first master when unset
    pub variant: Option<DcosVariant>,
    /// Login for the Enterprise check
    pub credentials: Credentials,
    /// Budget for the whole wait
    pub overall: RetryPolicy,
    /// Budget for each leader election
    pub leader: RetryPolicy,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self {
            http_checks: true,
            variant: None,
            credentials: Credentials::default(),
            overall: RetryPolicy::readiness(),
            leader: RetryPolicy::leader_check(),
        }
    }
}

impl ReadinessOptions {
    pub fn http_checks(mut self, http_checks: bool) -> Self {
        self.http_checks = http_checks;
        self
    }

    pub fn variant(mut self, variant: DcosVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn overall(mut self, policy: RetryPolicy) -> Self {
        self.overall = policy;
        self
    }

    pub fn leader(mut self, policy: RetryPolicy) -> Self {
        self.leader = policy;
        self
    }
}

/// What a successful wait found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub variant: DcosVariant,
    /// The agreed leader of each subsystem
    pub leaders: BTreeMap<Subsystem, String>,
}

/// Polls a cluster until it is ready
pub struct ReadinessEngine {
    opinions: Arc<dyn OpinionSource>,
    health: Arc<dyn HealthCheck>,
}

impl ReadinessEngine {
    pub fn new(opinions: Arc<dyn OpinionSource>, health: Arc<dyn HealthCheck>) -> Self {
        Self { opinions, health }
    }

    /// Engine talking to the masters over HTTPS
    pub fn http() -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpOpinionSource::new(REQUEST_TIMEOUT)?),
            Arc::new(HttpHealthCheck::new(REQUEST_TIMEOUT)?),
        ))
    }

    /// Engine asking for leader opinions on the masters themselves
    pub fn on_nodes() -> Result<Self> {
        Ok(Self::new(
            Arc::new(NodeOpinionSource::new(REQUEST_TIMEOUT)),
            Arc::new(HttpHealthCheck::new(REQUEST_TIMEOUT)?),
        ))
    }

    /// The engine suited to `nodes`: opinions are fetched on the masters when
    /// the host may not reach them over HTTP, either because HTTP checks are
    /// off or because the masters are only reachable through `docker exec`.
    pub fn for_nodes(nodes: &NodeGroups, options: &ReadinessOptions) -> Result<Self> {
        let docker_exec = nodes
            .masters
            .iter()
            .any(|master| master.transport() == NodeTransport::DockerExec);
        if !options.http_checks || docker_exec {
            Self::on_nodes()
        } else {
            Self::http()
        }
    }

    /// Wait until every node has a build manifest, every subsystem has one
    /// agreed leader and, if enabled, the HTTP checks pass on every master.
    pub async fn wait_for_ready(
        &self,
        nodes: &NodeGroups,
        options: &ReadinessOptions,
    ) -> Result<ReadinessReport> {
        if nodes.masters.is_empty() {
            return Err(E2eError::InvalidConfig("cluster has no masters".to_string()));
        }

        let start = Instant::now();
        let result = self.wait_phases(nodes, options, start).await;
        match &result {
            Ok(report) => info!(
                state = %ReadinessState::Ready,
                variant = %report.variant,
                "Cluster ready after {:?}",
                start.elapsed()
            ),
            Err(E2eError::ReadinessTimeout { state, .. }) => warn!(
                state = %ReadinessState::TimedOut,
                "Cluster not ready after {:?}, last state: {}",
                start.elapsed(),
                state
            ),
            Err(_) => {}
        }
        result
    }

    async fn wait_phases(
        &self,
        nodes: &NodeGroups,
        options: &ReadinessOptions,
        start: Instant,
    ) -> Result<ReadinessReport> {
        let remaining = |policy: RetryPolicy| {
            policy.capped_at(options.overall.budget.saturating_sub(start.elapsed()))
        };

        info!(
            state = %ReadinessState::WaitingForBuildManifest,
            nodes = nodes.len(),
            "Waiting for cluster"
        );
        let manifest_policy = remaining(options.overall);
        let build = wait_for_condition(
            &manifest_policy,
            ReadinessState::WaitingForBuildManifest,
            || async move { manifest_round(nodes).await.ok_or(CondCheckError::NotYet) },
        )
        .await?;
        let variant = options.variant.unwrap_or(build.variant);

        info!(
            state = %ReadinessState::WaitingForConsensus,
            version = %build.version,
            "Build manifest present"
        );
        let mut leaders = BTreeMap::new();
        for subsystem in Subsystem::ALL {
            let policy = remaining(options.leader);
            let leader =
                wait_for_leader(self.opinions.as_ref(), subsystem, &nodes.masters, &policy)
                    .await?;
            leaders.insert(subsystem, leader);
        }

        if options.http_checks {
            info!(state = %ReadinessState::WaitingForHttp, variant = %variant, "Leaders elected");
            let policy = remaining(options.overall);
            let health = self.health.as_ref();
            let credentials = &options.credentials;
            let masters = &nodes.masters;
            wait_for_condition(&policy, ReadinessState::WaitingForHttp, || async move {
                http_round(health, masters, variant, credentials)
                    .await
                    .then_some(())
                    .ok_or(CondCheckError::NotYet)
            })
            .await?;
        }

        Ok(ReadinessReport { variant, leaders })
    }
}

/// Build info from the first master, once every node has a manifest
async fn manifest_round(nodes: &NodeGroups) -> Option<BuildInfo> {
    let all: Vec<&Node> = nodes.all().collect();
    let round = join_all(all.iter().map(|node| node.build_info())).await;

    let mut first = None;
    for (node, info) in all.iter().zip(round) {
        match info {
            Ok(info) => {
                if first.is_none() {
                    first = Some(info);
                }
            }
            Err(err) => {
                debug!(node = %node, "No build manifest yet: {}", err);
                return None;
            }
        }
    }
    first
}

async fn http_round(
    health: &dyn HealthCheck,
    masters: &BTreeSet<Node>,
    variant: DcosVariant,
    credentials: &Credentials,
) -> bool {
    let round =
        join_all(masters.iter().map(|master| health.check(master, variant, credentials))).await;
    let mut healthy = true;
    for (master, result) in masters.iter().zip(round) {
        if let Err(err) = result {
            debug!(node = %master, "HTTP check failed: {}", err);
            healthy = false;
        }
    }
    healthy
}
