//! Clusters managed out of band

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use ocne_common::kube_utils::{self, api_server_responds, create_client};
use ocne_common::{ClusterConfig, Error, KubeVersion, Result};

use crate::driver::{node_update_help, Driver, Lifecycle, LifecycleState, StageOutcome, StartOutcome};

const DRIVER: &str = "none";

/// [`Driver`] for an existing cluster reached through a kubeconfig
///
/// Nothing is created or removed. The driver checks the cluster answers and
/// points node updates at `ocne node update`.
#[derive(Debug)]
pub struct NoneDriver {
    config: ClusterConfig,
    lifecycle: Lifecycle,
}

impl NoneDriver {
    /// A driver for the cluster behind `config.kubeconfig`
    pub fn new(config: ClusterConfig) -> Result<Self> {
        if config.kubeconfig.is_none() {
            return Err(Error::validation_for_field(
                "kubeconfig",
                "the none provider needs the kubeconfig of an existing cluster",
            ));
        }
        let lifecycle = Lifecycle::new(config.name.clone());
        Ok(Self { config, lifecycle })
    }

    fn kubeconfig(&self) -> Result<&Path> {
        self.config
            .kubeconfig
            .as_deref()
            .ok_or_else(|| Error::validation_for_field("kubeconfig", "no kubeconfig configured"))
    }
}

#[async_trait]
impl Driver for NoneDriver {
    async fn start(&mut self) -> Result<StartOutcome> {
        let kubeconfig = self.kubeconfig()?;
        let client = create_client(Some(kubeconfig)).await?;
        if !api_server_responds(&client).await {
            return Err(Error::precondition(
                self.config.name.clone(),
                format!("the API server behind {} does not respond", kubeconfig.display()),
            ));
        }
        info!(cluster = %self.config.name, "Cluster is reachable");
        self.lifecycle.observe_running();
        Ok(StartOutcome {
            already_running: true,
            changed: false,
        })
    }

    async fn post_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn join(&mut self, _kubeconfig: &Path, _control_planes: u32, _workers: u32) -> Result<()> {
        Err(Error::unsupported("join", DRIVER))
    }

    async fn stop(&mut self) -> Result<()> {
        Err(Error::unsupported("stop", DRIVER))
    }

    async fn delete(&mut self) -> Result<()> {
        info!(cluster = %self.config.name, "Cluster is managed elsewhere, nothing to delete");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stage(&mut self, version: &str) -> Result<StageOutcome> {
        let version = KubeVersion::parse(version)?.minor_string();
        let kubeconfig = self.kubeconfig()?.to_path_buf();
        self.lifecycle.observe_running();
        self.lifecycle.advance(LifecycleState::UpgradeStaged)?;
        Ok(StageOutcome {
            help_text: node_update_help(&self.config.name, &version, &kubeconfig),
            kubeconfig,
            changed: false,
        })
    }

    fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.config.kubeconfig.clone()
    }

    fn kube_api_server_address(&self) -> Result<String> {
        let server = kube_utils::kubeconfig_server(self.kubeconfig()?)?;
        kube_utils::endpoint_from_server_url(&server)
    }

    fn post_install_help_stanza(&self) -> String {
        match &self.config.kubeconfig {
            Some(path) => format!("To access the cluster:\n    export KUBECONFIG={}\n", path.display()),
            None => String::new(),
        }
    }

    fn default_cni_interfaces(&self) -> Vec<String> {
        Vec::new()
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}
