//! Driver selection

use tracing::debug;

use ocne_common::{ClusterConfig, ProviderKind, Result};

use crate::driver::Driver;
use crate::libvirt::LibvirtDriver;
use crate::none::NoneDriver;
use crate::oci::OciDriver;

/// Create the driver for `config.provider`
///
/// The configuration is validated first, so a driver never sees an
/// inconsistent provider section.
pub async fn create_driver(config: ClusterConfig, show_ui: bool) -> Result<Box<dyn Driver>> {
    config.validate()?;
    debug!(cluster = %config.name, provider = %config.provider, "Creating driver");
    match config.provider {
        ProviderKind::Libvirt => Ok(Box::new(LibvirtDriver::connect(config, show_ui).await?)),
        ProviderKind::Oci => Ok(Box::new(OciDriver::new(config, show_ui))),
        ProviderKind::None => Ok(Box::new(NoneDriver::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LifecycleState;
    use ocne_common::Error;
    use std::path::PathBuf;

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_connecting() {
        let config = ClusterConfig {
            provider: ProviderKind::Oci,
            worker_nodes: 0,
            ..Default::default()
        };
        let err = create_driver(config, false).await.err().unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn provider_kind_selects_the_driver() {
        let config = ClusterConfig {
            provider: ProviderKind::None,
            kubeconfig: Some(PathBuf::from("/tmp/does-not-matter")),
            ..Default::default()
        };
        let driver = create_driver(config, false).await.unwrap();
        assert_eq!(driver.kubeconfig_path(), Some(PathBuf::from("/tmp/does-not-matter")));
        assert_eq!(driver.state(), LifecycleState::Absent);

        let mut config = ClusterConfig {
            provider: ProviderKind::Oci,
            worker_nodes: 1,
            ..Default::default()
        };
        config.providers.oci.compartment = "ocid1.compartment.oc1..aaa".to_string();
        let driver = create_driver(config, false).await.unwrap();
        assert!(driver.kubeconfig_path().is_none());
    }
}
