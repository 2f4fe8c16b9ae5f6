//! Installed build manifest

use super::Node;
use crate::error::{E2eError, Result};
use crate::installer::DcosVariant;
use crate::transport::RunRequest;
use serde::Deserialize;

/// Version manifest written by the installer
pub const VERSION_MANIFEST: &str = "/opt/mesosphere/etc/dcos-version.json";
/// Bootstrap config; only Enterprise builds carry a `security` key
pub const BOOTSTRAP_CONFIG: &str = "/opt/mesosphere/etc/bootstrap-config.json";

/// Variant and version of an installed DC/OS build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub variant: DcosVariant,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct VersionManifest {
    version: String,
}

fn parse_version(manifest: &str) -> Result<String> {
    let manifest: VersionManifest = serde_json::from_str(manifest)?;
    Ok(manifest.version)
}

fn parse_variant(bootstrap_config: &str) -> Result<DcosVariant> {
    let config: serde_json::Value = serde_json::from_str(bootstrap_config)?;
    let object = config.as_object().ok_or_else(|| {
        E2eError::Internal(format!("{} is not a JSON object", BOOTSTRAP_CONFIG))
    })?;
    Ok(if object.contains_key("security") {
        DcosVariant::Enterprise
    } else {
        DcosVariant::Oss
    })
}

pub(crate) async fn read(node: &Node) -> Result<BuildInfo> {
    let manifest = node.run(&RunRequest::new(["cat", VERSION_MANIFEST])).await?;
    let bootstrap = node.run(&RunRequest::new(["cat", BOOTSTRAP_CONFIG])).await?;

    Ok(BuildInfo {
        version: parse_version(&manifest.stdout)?,
        variant: parse_variant(&bootstrap.stdout)?,
    })
}
