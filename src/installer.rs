//! Installer introspection
//!
//! Finds out which DC/OS variant and version an installer artifact contains
//! without installing it, by running the artifact with `--version`.
//!
//! The first run of an installer in a directory extracts its image and
//! prints progress lines before the JSON answer. A second run in the same
//! directory reuses the extraction and prints only JSON, so the installer
//! is always run twice and the first output is thrown away.

use crate::error::{E2eError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Edition of DC/OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DcosVariant {
    /// Open source DC/OS
    Oss,
    /// DC/OS Enterprise
    Enterprise,
}

impl DcosVariant {
    /// Parse the `variant` field printed by `--version`
    pub fn from_installer_variant(variant: &str) -> Result<Self> {
        match variant {
            "" => Ok(DcosVariant::Oss),
            "ee" => Ok(DcosVariant::Enterprise),
            other => Err(E2eError::InstallerIntrospectionFailed(format!(
                "unknown installer variant {:?}",
                other
            ))),
        }
    }

    /// The `variant` value as the installer spells it
    pub fn installer_variant(&self) -> &'static str {
        match self {
            DcosVariant::Oss => "",
            DcosVariant::Enterprise => "ee",
        }
    }
}

impl std::fmt::Display for DcosVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DcosVariant::Oss => write!(f, "oss"),
            DcosVariant::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Variant requested by a caller, possibly left for detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantChoice {
    /// Ask the installer
    #[default]
    Auto,
    Known(DcosVariant),
}

#[derive(Debug, Deserialize)]
struct VersionOutput {
    version: String,
    variant: String,
}

/// Variant and version of a local installer.
///
/// `workspace_dir` hosts a scratch directory for the installer's extraction,
/// removed again before returning.
pub async fn get_variant_and_version(
    installer: &Path,
    workspace_dir: &Path,
) -> Result<(DcosVariant, String)> {
    if installer.to_string_lossy().contains(' ') {
        return Err(E2eError::InstallerIntrospectionFailed(format!(
            "installer path {} contains a space, which the installer cannot handle",
            installer.display()
        )));
    }

    let scratch = workspace_dir.join(format!("installer-version-{}", Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&scratch).await?;

    let result = query_version(installer, &scratch).await;
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    let (variant, version) = result?;

    info!(
        installer = %installer.display(),
        variant = %variant,
        version = %version,
        "Inspected installer"
    );
    Ok((variant, version))
}

/// Download an installer into `workspace_dir` and inspect it
pub async fn get_variant_and_version_from_url(
    url: &str,
    workspace_dir: &Path,
) -> Result<(DcosVariant, String)> {
    let installer = download_installer(url, workspace_dir).await?;
    let result = get_variant_and_version(&installer, workspace_dir).await;
    let _ = tokio::fs::remove_file(&installer).await;
    result
}

/// Resolve a [`VariantChoice`] against a local installer
pub async fn resolve_variant(
    choice: VariantChoice,
    installer: &Path,
    workspace_dir: &Path,
) -> Result<DcosVariant> {
    match choice {
        VariantChoice::Known(variant) => Ok(variant),
        VariantChoice::Auto => Ok(get_variant_and_version(installer, workspace_dir).await?.0),
    }
}

async fn query_version(installer: &Path, scratch: &Path) -> Result<(DcosVariant, String)> {
    let first = run_version_query(installer, scratch).await?;
    debug!("Discarding first --version output: {}", first.trim());

    let second = run_version_query(installer, scratch).await?;
    parse_version_output(&second)
}

async fn run_version_query(installer: &Path, scratch: &Path) -> Result<String> {
    let output = Command::new("bash")
        .arg(installer)
        .arg("--version")
        .current_dir(scratch)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            E2eError::InstallerIntrospectionFailed(format!(
                "could not run {}: {}",
                installer.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(E2eError::InstallerIntrospectionFailed(format!(
            "{} --version exited with {}: {}",
            installer.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_version_output(stdout: &str) -> Result<(DcosVariant, String)> {
    let parsed: VersionOutput = serde_json::from_str(stdout.trim()).map_err(|e| {
        E2eError::InstallerIntrospectionFailed(format!(
            "unexpected --version output {:?}: {}",
            stdout.trim(),
            e
        ))
    })?;
    let variant = DcosVariant::from_installer_variant(&parsed.variant)?;
    Ok((variant, parsed.version))
}

async fn download_installer(url: &str, workspace_dir: &Path) -> Result<PathBuf> {
    let destination = workspace_dir.join(format!(
        "dcos_generate_config-{}.sh",
        Uuid::new_v4().simple()
    ));
    info!("Downloading installer {} to {}", url, destination.display());

    let mut response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| E2eError::Http(e.to_string()))?;

    tokio::fs::create_dir_all(workspace_dir).await?;
    let mut file = tokio::fs::File::create(&destination).await?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| E2eError::Http(e.to_string()))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(destination)
}
