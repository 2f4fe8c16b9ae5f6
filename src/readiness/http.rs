//! HTTP health of a cluster's public endpoint

use crate::error::{E2eError, Result};
use crate::installer::DcosVariant;
use crate::node::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Login used for the Enterprise authentication check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// The superuser an Enterprise test cluster is configured with
    pub fn default_enterprise() -> Self {
        Self::new("bootstrapuser", "deleteme")
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::default_enterprise()
    }
}

/// A check that a master serves the cluster's public HTTP surface
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `Ok(())` once `master` answers as a working cluster
    async fn check(
        &self,
        master: &Node,
        variant: DcosVariant,
        credentials: &Credentials,
    ) -> Result<()>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    uid: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

/// Checks the admin router on each master.
///
/// Open source clusters must serve their version metadata; Enterprise
/// clusters must hand out an auth token for the given credentials.
pub struct HttpHealthCheck {
    client: reqwest::Client,
}

impl HttpHealthCheck {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| E2eError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

fn host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
    }
}

pub(crate) fn metadata_url(ip: IpAddr) -> String {
    format!("http://{}/dcos-metadata/dcos-version.json", host(ip))
}

pub(crate) fn login_url(ip: IpAddr) -> String {
    format!("https://{}/acs/api/v1/auth/login", host(ip))
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(
        &self,
        master: &Node,
        variant: DcosVariant,
        credentials: &Credentials,
    ) -> Result<()> {
        match variant {
            DcosVariant::Oss => {
                let url = metadata_url(master.public_ip());
                self.client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| E2eError::Http(format!("{}: {}", url, e)))?;
                debug!(node = %master, "Version metadata served");
            }
            DcosVariant::Enterprise => {
                let url = login_url(master.public_ip());
                let response = self
                    .client
                    .post(&url)
                    .json(&LoginRequest {
                        uid: &credentials.username,
                        password: &credentials.password,
                    })
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| E2eError::Http(format!("{}: {}", url, e)))?;

                let login: LoginResponse = response
                    .json()
                    .await
                    .map_err(|e| E2eError::Http(e.to_string()))?;
                if login.token.is_none() {
                    return Err(E2eError::Http(format!("{}: response has no token", url)));
                }
                debug!(node = %master, user = %credentials.username, "Logged in");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        assert_eq!(
            metadata_url("10.0.0.1".parse().unwrap()),
            "http://10.0.0.1/dcos-metadata/dcos-version.json"
        );
        assert_eq!(
            login_url("fd00::1".parse().unwrap()),
            "https://[fd00::1]/acs/api/v1/auth/login"
        );
    }

    #[test]
    fn test_default_credentials() {
        let credentials = Credentials::default();
        assert_eq!(credentials.username, "bootstrapuser");
        assert_eq!(credentials.password, "deleteme");
    }

    #[test]
    fn test_login_body() {
        let body = serde_json::to_value(LoginRequest {
            uid: "bootstrapuser",
            password: "deleteme",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"uid": "bootstrapuser", "password": "deleteme"}));
    }
}
