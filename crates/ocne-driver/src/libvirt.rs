//! Clusters of libvirt domains

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use ocne_common::{ClusterConfig, KubeVersion, Result};
use ocne_libvirt::Provisioner;

use crate::driver::{node_update_help, Driver, Lifecycle, LifecycleState, StageOutcome, StartOutcome};

/// [`Driver`] for clusters on a local or remote hypervisor
#[derive(Debug)]
pub struct LibvirtDriver {
    provisioner: Provisioner,
    lifecycle: Lifecycle,
}

impl LibvirtDriver {
    /// Wrap a provisioner
    pub fn new(provisioner: Provisioner) -> Self {
        let lifecycle = Lifecycle::new(provisioner.config().name.clone());
        Self {
            provisioner,
            lifecycle,
        }
    }

    /// Connect to the hypervisor named by the configuration
    pub async fn connect(config: ClusterConfig, show_ui: bool) -> Result<Self> {
        let provisioner = Provisioner::connect(config).await?.with_ui(show_ui);
        Ok(Self::new(provisioner))
    }

    /// True if the first control plane domain exists and its API answers
    pub async fn is_running(&self) -> Result<bool> {
        self.provisioner.is_running().await
    }

    fn cluster(&self) -> &str {
        &self.provisioner.config().name
    }

    async fn bring_up(&mut self) -> Result<StartOutcome> {
        if self.provisioner.is_running().await? {
            self.lifecycle.observe_running();
            return Ok(StartOutcome {
                already_running: true,
                changed: false,
            });
        }
        self.lifecycle.advance(LifecycleState::Bootstrapping)?;
        let join_endpoint = self.provisioner.start_first_control_plane().await?;
        self.lifecycle.advance(LifecycleState::ControlPlaneReady)?;
        self.lifecycle.advance(LifecycleState::WorkersJoining)?;
        self.provisioner.join_remaining(&join_endpoint).await?;
        self.lifecycle.advance(LifecycleState::Ready)?;
        Ok(StartOutcome {
            already_running: false,
            changed: true,
        })
    }

    async fn add_nodes(&mut self, kubeconfig: &Path, control_planes: u32, workers: u32) -> Result<()> {
        self.lifecycle.advance(LifecycleState::WorkersJoining)?;
        self.provisioner.join(kubeconfig, control_planes, workers).await?;
        self.lifecycle.advance(LifecycleState::Ready)
    }
}

#[async_trait]
impl Driver for LibvirtDriver {
    async fn start(&mut self) -> Result<StartOutcome> {
        let before = self.lifecycle.state();
        let result = self.bring_up().await;
        if result.is_err() {
            self.lifecycle.restore(before);
        }
        result
    }

    async fn post_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn join(&mut self, kubeconfig: &Path, control_planes: u32, workers: u32) -> Result<()> {
        self.lifecycle.observe_running();
        let before = self.lifecycle.state();
        let result = self.add_nodes(kubeconfig, control_planes, workers).await;
        if result.is_err() {
            self.lifecycle.restore(before);
        }
        result
    }

    async fn stop(&mut self) -> Result<()> {
        self.provisioner.stop().await
    }

    async fn delete(&mut self) -> Result<()> {
        self.lifecycle.advance(LifecycleState::Deleting)?;
        self.provisioner.delete().await?;
        self.lifecycle.advance(LifecycleState::Absent)
    }

    fn close(&mut self) -> Result<()> {
        self.provisioner.close()
    }

    async fn stage(&mut self, version: &str) -> Result<StageOutcome> {
        let version = KubeVersion::parse(version)?.minor_string();
        self.lifecycle.observe_running();
        self.lifecycle.advance(LifecycleState::UpgradeStaged)?;
        let kubeconfig = self.provisioner.kubeconfig_path();
        info!(cluster = %self.cluster(), version = %version, "Nodes update in place");
        Ok(StageOutcome {
            help_text: node_update_help(self.cluster(), &version, &kubeconfig),
            kubeconfig,
            changed: false,
        })
    }

    fn kubeconfig_path(&self) -> Option<PathBuf> {
        Some(self.provisioner.kubeconfig_path())
    }

    fn kube_api_server_address(&self) -> Result<String> {
        self.provisioner.api_server_address()
    }

    fn post_install_help_stanza(&self) -> String {
        let local = self.provisioner.kubeconfig_path();
        let vm = self.provisioner.vm_kubeconfig_path();
        format!(
            "To access the cluster from this machine:\n    export KUBECONFIG={}\n\
             To access the cluster from another node on the hypervisor network:\n    export KUBECONFIG={}\n",
            local.display(),
            vm.display()
        )
    }

    fn default_cni_interfaces(&self) -> Vec<String> {
        self.provisioner.guest_devices()
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use ocne_common::image::ImageInspector;
    use ocne_common::Error;
    use ocne_libvirt::uri::parse_session_uri;
    use ocne_libvirt::{Hypervisor, NetworkAccounting, SessionUri};

    /// A hypervisor with no domains whose storage pools cannot be listed
    struct PoolsUnavailable;

    fn unavailable<T>() -> Result<T> {
        Err(Error::command("virsh", "failed to connect to the hypervisor"))
    }

    #[async_trait]
    impl Hypervisor for PoolsUnavailable {
        async fn list_domains(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn define_domain(&self, _xml: &str) -> Result<()> {
            unavailable()
        }
        async fn start_domain(&self, _name: &str) -> Result<()> {
            unavailable()
        }
        async fn shutdown_domain(&self, _name: &str) -> Result<()> {
            unavailable()
        }
        async fn destroy_domain(&self, _name: &str) -> Result<()> {
            unavailable()
        }
        async fn undefine_domain(&self, _name: &str) -> Result<()> {
            unavailable()
        }
        async fn network_xml(&self, _name: &str) -> Result<String> {
            unavailable()
        }
        async fn list_pools(&self) -> Result<Vec<String>> {
            unavailable()
        }
        async fn list_active_pools(&self) -> Result<Vec<String>> {
            unavailable()
        }
        async fn pool_xml(&self, _name: &str) -> Result<String> {
            unavailable()
        }
        async fn create_pool(&self, _name: &str, _xml: &str) -> Result<()> {
            unavailable()
        }
        async fn refresh_pool(&self, _name: &str) -> Result<()> {
            unavailable()
        }
        async fn list_volumes(&self, _pool: &str) -> Result<Vec<String>> {
            unavailable()
        }
        async fn volume_path(&self, _pool: &str, _name: &str) -> Result<String> {
            unavailable()
        }
        async fn create_volume(&self, _pool: &str, _xml: &str) -> Result<()> {
            unavailable()
        }
        async fn upload_volume(&self, _pool: &str, _name: &str, _file: &Path) -> Result<()> {
            unavailable()
        }
        async fn delete_volume(&self, _pool: &str, _name: &str) -> Result<()> {
            unavailable()
        }
    }

    struct NoImages;

    #[async_trait]
    impl ImageInspector for NoImages {
        async fn created(&self, _image: &str, _arch: &str) -> Result<DateTime<Utc>> {
            unavailable()
        }
        async fn extract_boot_disk(&self, _image: &str, _arch: &str, _dest: &Path) -> Result<()> {
            unavailable()
        }
    }

    fn driver(dir: &tempfile::TempDir) -> LibvirtDriver {
        let config = ClusterConfig {
            name: "demo".to_string(),
            kubernetes_version: "1.31.2".to_string(),
            ..Default::default()
        };
        let uri = SessionUri::from_parts(parse_session_uri("qemu:///session").unwrap(), None, true);
        LibvirtDriver::new(Provisioner::new(
            config,
            uri,
            Arc::new(PoolsUnavailable),
            Arc::new(NoImages),
            NetworkAccounting::new(dir.path().join("ips.yaml")),
            dir.path().to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn start_can_be_retried_after_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(&dir);

        let err = driver.start().await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }), "{err}");
        assert_eq!(driver.state(), LifecycleState::Absent);

        let err = driver.start().await.unwrap_err();
        assert!(!matches!(err, Error::Precondition { .. }), "{err}");
        assert_eq!(driver.state(), LifecycleState::Absent);

        driver.delete().await.unwrap();
        assert_eq!(driver.state(), LifecycleState::Absent);
        driver.close().unwrap();
    }

    #[test]
    fn cni_binds_to_the_guest_devices() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(driver(&dir).default_cni_interfaces(), vec!["enp1s0".to_string()]);
    }
}
