//! Helm release management through the `helm` CLI.
//!
//! Extensions install into worker clusters, so every release operation
//! runs against a kubeconfig written to a private temp file for the
//! duration of the call. Output is requested as JSON and parsed into the
//! release summary mirrored into Extension status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use stratus_common::crd::HelmRelease;
use stratus_common::{Error, Result};

/// Chart coordinates and values for one install/upgrade
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HelmInstallRequest {
    /// Release name
    pub release: String,
    /// Repository alias the chart is pulled from
    pub repository: String,
    pub chart: String,
    pub version: Option<String>,
    pub namespace: String,
    pub values: BTreeMap<String, String>,
}

/// Release operations against a worker cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// Register a chart repository under the given alias
    async fn add_repository(&self, name: &str, url: &str) -> Result<()>;

    /// Drop a chart repository alias; unknown aliases are not an error
    async fn remove_repository(&self, name: &str) -> Result<()>;

    /// Install or upgrade a release in the cluster the kubeconfig points at
    async fn install(&self, kube_config: &str, request: &HelmInstallRequest)
        -> Result<HelmRelease>;

    /// Uninstall a release; a missing release counts as success
    async fn uninstall(&self, kube_config: &str, namespace: &str, release: &str) -> Result<()>;

    /// Release summary, or `None` when the release does not exist
    async fn status(
        &self,
        kube_config: &str,
        namespace: &str,
        release: &str,
    ) -> Result<Option<HelmRelease>>;
}

// =============================================================================
// CLI-backed implementation
// =============================================================================

#[derive(Default)]
pub struct HelmCli {
    counter: AtomicU64,
}

impl HelmCli {
    pub fn new() -> Self {
        Self::default()
    }

    fn scratch_path(&self) -> PathBuf {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "stratus-helm-{}-{}.kubeconfig",
            std::process::id(),
            seq
        ))
    }

    async fn run(args: &[String]) -> Result<Vec<u8>> {
        debug!(args = ?args, "running helm");
        let output = Command::new("helm")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::helm("helm", format!("failed to spawn helm: {e}")))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(cli_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Run helm with `--kubeconfig` pointing at a scratch copy of the blob
    async fn run_with_kubeconfig(&self, kube_config: &str, mut args: Vec<String>) -> Result<Vec<u8>> {
        let path = self.scratch_path();
        tokio::fs::write(&path, kube_config)
            .await
            .map_err(|e| Error::helm("helm", format!("writing kubeconfig: {e}")))?;
        args.push("--kubeconfig".to_string());
        args.push(path.display().to_string());
        let result = Self::run(&args).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove scratch kubeconfig");
        }
        result
    }
}

#[async_trait]
impl HelmClient for HelmCli {
    async fn add_repository(&self, name: &str, url: &str) -> Result<()> {
        Self::run(&[
            "repo".to_string(),
            "add".to_string(),
            name.to_string(),
            url.to_string(),
            "--force-update".to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn remove_repository(&self, name: &str) -> Result<()> {
        match Self::run(&["repo".to_string(), "remove".to_string(), name.to_string()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn install(
        &self,
        kube_config: &str,
        request: &HelmInstallRequest,
    ) -> Result<HelmRelease> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            request.release.clone(),
            format!("{}/{}", request.repository, request.chart),
            "--namespace".to_string(),
            request.namespace.clone(),
            "--create-namespace".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        if let Some(version) = &request.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        for (key, value) in &request.values {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }
        let stdout = self.run_with_kubeconfig(kube_config, args).await?;
        parse_release(&stdout)
    }

    async fn uninstall(&self, kube_config: &str, namespace: &str, release: &str) -> Result<()> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        match self.run_with_kubeconfig(kube_config, args).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn status(
        &self,
        kube_config: &str,
        namespace: &str,
        release: &str,
    ) -> Result<Option<HelmRelease>> {
        let args = vec![
            "status".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--show-resources".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        match self.run_with_kubeconfig(kube_config, args).await {
            Ok(stdout) => Ok(Some(parse_release(&stdout)?)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Markers helm prints for failures that no amount of retrying will fix
const TERMINAL_MARKERS: &[&str] = &[
    "not found",
    "not a valid chart repository",
    "no repo named",
];

/// Wrap helm stderr, marking permanent failures as terminal so the
/// reconcilers park in Failed instead of retrying forever
fn cli_error(stderr: String) -> Error {
    if TERMINAL_MARKERS.iter().any(|m| stderr.contains(m)) {
        Error::helm_terminal("helm", stderr)
    } else {
        Error::helm("helm", stderr)
    }
}

/// Helm reports a missing release as `release: not found`; other
/// not-found errors (charts, repos) must not be mistaken for it
fn is_missing(error: &Error) -> bool {
    error.to_string().contains("release: not found")
}

// =============================================================================
// Output parsing
// =============================================================================

#[derive(Deserialize)]
struct CliRelease {
    #[serde(default)]
    version: i32,
    #[serde(default)]
    info: CliInfo,
    chart: Option<CliChart>,
    manifest: Option<String>,
}

#[derive(Default, Deserialize)]
struct CliInfo {
    status: Option<String>,
}

#[derive(Deserialize)]
struct CliChart {
    metadata: Option<CliChartMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliChartMetadata {
    name: Option<String>,
    version: Option<String>,
    app_version: Option<String>,
}

/// Parse `helm ... -o json` output into the status summary
fn parse_release(stdout: &[u8]) -> Result<HelmRelease> {
    let release: CliRelease = serde_json::from_slice(stdout)
        .map_err(|e| Error::serialization_of("helm release", e.to_string()))?;
    let metadata = release.chart.and_then(|c| c.metadata);
    let chart = metadata.as_ref().and_then(|m| {
        m.name.as_ref().map(|name| match &m.version {
            Some(version) => format!("{name}-{version}"),
            None => name.clone(),
        })
    });
    Ok(HelmRelease {
        chart,
        app_version: metadata.and_then(|m| m.app_version),
        revision: release.version,
        status: release.info.status,
        resources: release
            .manifest
            .map(|m| m.split("\n---").filter(|doc| !doc.trim().is_empty()).count())
            .unwrap_or(0),
    })
}
