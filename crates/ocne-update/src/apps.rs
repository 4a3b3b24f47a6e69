//! kube-proxy and CoreDNS as managed applications
//!
//! kubeadm installs both as plain manifests. Before the first update they are
//! adopted as releases from the application catalog, carrying over the
//! configuration kubeadm wrote so the adopted release behaves identically.

use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use ocne_common::command::Cmd;
use ocne_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};

use crate::ops::NodeOps;

/// Catalog repository managed applications are installed from
pub const DEFAULT_CATALOG: &str = "ocne-catalog";

/// One application release
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedApp {
    /// Release name
    pub release: String,
    /// Namespace
    pub namespace: String,
    /// Chart name inside the catalog
    pub chart: String,
    /// Values for the release
    pub values: Value,
}

/// Installs and inspects application releases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppInstaller: Send + Sync {
    /// True if a release of this name exists
    async fn is_installed(&self, namespace: &str, release: &str) -> Result<bool>;

    /// Install or upgrade a release
    async fn install(&self, app: &ManagedApp) -> Result<()>;
}

/// [`AppInstaller`] backed by the `helm` binary
#[derive(Clone, Debug)]
pub struct HelmInstaller {
    kubeconfig: Option<PathBuf>,
    catalog: String,
}

impl HelmInstaller {
    /// Installer for the cluster behind `kubeconfig`
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            catalog: DEFAULT_CATALOG.to_string(),
        }
    }

    /// Install from a different catalog repository
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = catalog.into();
        self
    }

    fn helm(&self) -> Cmd {
        let cmd = Cmd::new("helm");
        match &self.kubeconfig {
            Some(path) => cmd.arg("--kubeconfig").arg(path),
            None => cmd,
        }
    }
}

#[async_trait]
impl AppInstaller for HelmInstaller {
    async fn is_installed(&self, namespace: &str, release: &str) -> Result<bool> {
        let out = self
            .helm()
            .args(["list", "--short", "--namespace", namespace, "--filter"])
            .arg(format!("^{release}$"))
            .output()
            .await?;
        Ok(out.lines().any(|l| l.trim() == release))
    }

    async fn install(&self, app: &ManagedApp) -> Result<()> {
        let values = serde_yaml::to_string(&app.values)?;
        self.helm()
            .args(["upgrade", "--install", app.release.as_str()])
            .arg(format!("{}/{}", self.catalog, app.chart))
            .args(["--namespace", app.namespace.as_str(), "--values", "-"])
            .stdin(values.into_bytes())
            .output()
            .await?;
        info!(release = %app.release, namespace = %app.namespace, "Installed managed application");
        Ok(())
    }
}

fn config_value(cm: &ConfigMap, key: &str) -> Result<String> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
        .ok_or_else(|| {
            let name = cm.metadata.name.clone().unwrap_or_default();
            Error::validation_for_field(format!("data.{key}"), format!("ConfigMap {name} has no {key}"))
        })
}

/// Release values preserving kube-proxy's kubeadm configuration
pub fn kube_proxy_values(cm: &ConfigMap) -> Result<Value> {
    let config: Value = serde_yaml::from_str(&config_value(cm, "config.conf")?)?;
    let kubeconfig: Value = serde_yaml::from_str(&config_value(cm, "kubeconfig.conf")?)?;
    let mut values = Mapping::new();
    values.insert("config".into(), config);
    values.insert("kubeconfig".into(), kubeconfig);
    Ok(Value::Mapping(values))
}

/// Release values preserving the Corefile kubeadm wrote
pub fn coredns_values(cm: &ConfigMap) -> Result<Value> {
    let mut values = Mapping::new();
    values.insert("corefile".into(), Value::String(config_value(cm, "Corefile")?));
    Ok(Value::Mapping(values))
}

struct Adoption {
    release: &'static str,
    config_map: &'static str,
    values: fn(&ConfigMap) -> Result<Value>,
}

const ADOPTIONS: &[Adoption] = &[
    Adoption {
        release: "kube-proxy",
        config_map: "kube-proxy",
        values: kube_proxy_values,
    },
    Adoption {
        release: "coredns",
        config_map: "coredns",
        values: coredns_values,
    },
];

/// Adopt kube-proxy and CoreDNS as managed applications if they are not yet
///
/// Returns the releases that were installed. A missing ConfigMap means the
/// component is not deployed and is skipped.
pub async fn adopt_managed_apps(ops: &dyn NodeOps, installer: &dyn AppInstaller) -> Result<Vec<String>> {
    let mut installed = Vec::new();
    for adoption in ADOPTIONS {
        if installer.is_installed(KUBE_SYSTEM_NAMESPACE, adoption.release).await? {
            debug!(release = adoption.release, "Already a managed application");
            continue;
        }
        let Some(cm) = ops.config_map(KUBE_SYSTEM_NAMESPACE, adoption.config_map).await? else {
            debug!(config_map = adoption.config_map, "Component not deployed, skipping");
            continue;
        };
        let app = ManagedApp {
            release: adoption.release.to_string(),
            namespace: KUBE_SYSTEM_NAMESPACE.to_string(),
            chart: adoption.release.to_string(),
            values: (adoption.values)(&cm)?,
        };
        installer.install(&app).await?;
        installed.push(app.release);
    }
    Ok(installed)
}
