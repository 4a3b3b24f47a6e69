//! CLI commands

use std::path::{Path, PathBuf};

use clap::Args;

use ocne_common::{ClusterConfig, ProviderKind, ENV_DEFAULTS};

use crate::{Error, Result};

pub mod cluster;
pub mod node;

/// Where the cluster configuration comes from
#[derive(Args, Debug, Default)]
pub struct ClusterArgs {
    /// Cluster configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Cluster name, overriding the configuration
    #[arg(short = 'C', long = "cluster-name")]
    pub name: Option<String>,

    /// Provider: libvirt, oci or none
    #[arg(short = 'P', long = "provider", value_parser = parse_provider)]
    pub provider: Option<ProviderKind>,

    /// Kubeconfig of an existing cluster
    #[arg(short = 'k', long = "kubeconfig")]
    pub kubeconfig: Option<PathBuf>,
}

fn parse_provider(s: &str) -> std::result::Result<ProviderKind, String> {
    match s {
        "libvirt" => Ok(ProviderKind::Libvirt),
        "oci" => Ok(ProviderKind::Oci),
        "none" => Ok(ProviderKind::None),
        other => Err(format!("unknown provider {other:?}, expected libvirt, oci or none")),
    }
}

impl ClusterArgs {
    /// The configuration file, the defaults file or built-in defaults, with flags applied
    pub fn load(&self) -> Result<ClusterConfig> {
        let defaults = std::env::var(ENV_DEFAULTS).ok().filter(|p| !p.is_empty());
        let mut config = match (&self.config, defaults) {
            (Some(path), _) => ClusterConfig::load(path)?,
            (None, Some(path)) => ClusterConfig::load(Path::new(&path))?,
            (None, None) => ClusterConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut ClusterConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            config.kubeconfig = Some(kubeconfig.clone());
        }
    }

    /// The kubeconfig flag, required by commands acting on a running cluster
    pub fn require_kubeconfig(&self) -> Result<PathBuf> {
        self.kubeconfig
            .clone()
            .ok_or_else(|| Error::validation("--kubeconfig is required"))
    }
}
