//! Clusters on OCI through Cluster API
//!
//! Cluster resources live on a management cluster: one the user names, or an
//! ephemeral single-node hypervisor cluster started on demand. A self-managed
//! cluster takes its own resources over after start and hands them back to
//! an ephemeral cluster before it is deleted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info, warn};

use ocne_capi::clusterctl::{
    delete_cluster, move_to_kubeconfig, wait_for_cluster_deletion, CapiInstaller, ClusterctlInstaller,
    CLUSTER_DELETION_TIMEOUT,
};
use ocne_capi::shape::correct_image_capabilities;
use ocne_capi::template::{cluster_definition, required_architectures, ClusterIdentity};
use ocne_capi::workrequest::WORK_REQUEST_POLL_INTERVAL;
use ocne_capi::{
    wait_for_work_requests, ClusterApi, ImageBuilder, ImageProvider, KubeClusterApi, OciCli, OciClient,
    PodImageConverter, StageOptions, StagePlanner, CAPI_API_VERSION, KIND_CLUSTER,
};
use ocne_common::image::{ImageInspector, SkopeoInspector};
use ocne_common::kube_utils::{
    self, api_server_responds, apply_manifests, create_client, node_is_ready, wait_for_kubeconfig_secret,
    write_memory_kubeconfig, DEFAULT_POLL_INTERVAL, KUBECONFIG_SECRET_TIMEOUT,
};
use ocne_common::retry::poll_until;
use ocne_common::waiter::{wait_for_all, Waiter};
use ocne_common::{env_flag, paths, ClusterConfig, Error, ProviderKind, Result, ENV_STAGE_FORCE_UPLOAD};

use crate::driver::{Driver, Lifecycle, LifecycleState, StageOutcome, StartOutcome};
use crate::libvirt::LibvirtDriver;

const DRIVER: &str = "oci";

/// Name of the hypervisor cluster started when no management cluster is given
pub const EPHEMERAL_CLUSTER_NAME: &str = "ocne-ephemeral";

/// How long every requested node may take to join and become ready
pub const NODES_READY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Configuration of the ephemeral management cluster for `config`
pub fn ephemeral_config(config: &ClusterConfig) -> ClusterConfig {
    let mut ephemeral = ClusterConfig {
        name: EPHEMERAL_CLUSTER_NAME.to_string(),
        provider: ProviderKind::Libvirt,
        kubernetes_version: config.kubernetes_version.clone(),
        boot_volume_container_image: config.boot_volume_container_image.clone(),
        os_registry: config.os_registry.clone(),
        proxy: config.proxy.clone(),
        working_directory: config.working_directory.clone(),
        ssh_public_key: config.ssh_public_key.clone(),
        password: config.password.clone(),
        control_plane_nodes: 1,
        worker_nodes: 0,
        ..Default::default()
    };
    ephemeral.providers.libvirt = config.providers.libvirt.clone();
    ephemeral
}

/// Prefix a resource stream with the namespace it is applied to
pub fn with_namespace(namespace: &str, definition: &str) -> String {
    format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {namespace}\n---\n{definition}")
}

/// Find or build a node image for every architecture the shapes need
///
/// Builds for different architectures run concurrently. Returns
/// architecture to image OCID. New imports are waited for and get their
/// capabilities corrected before returning.
pub async fn ensure_images(
    config: &ClusterConfig,
    oci: Arc<dyn OciClient>,
    images: &dyn ImageProvider,
    show_ui: bool,
) -> Result<BTreeMap<String, String>> {
    let settings = &config.providers.oci;
    let force = env_flag(ENV_STAGE_FORCE_UPLOAD);
    let arches = required_architectures(config);
    let builds = try_join_all(
        arches
            .iter()
            .map(|arch| images.ensure_image(&settings.image_name, arch, &config.kubernetes_version, force)),
    )
    .await?;

    let mut ids = BTreeMap::new();
    let mut requests = BTreeMap::new();
    let mut imported = Vec::new();
    for (arch, built) in arches.into_iter().zip(builds) {
        if let Some(request) = built.work_request_id {
            requests.insert(request, format!("Importing the {arch} node image"));
            imported.push((built.image_id.clone(), arch));
        }
        debug!(arch, image = %built.image_id, "Node image");
        ids.insert(arch.to_string(), built.image_id);
    }

    wait_for_work_requests(Arc::clone(&oci), &requests, WORK_REQUEST_POLL_INTERVAL, show_ui).await?;
    for (image, arch) in imported {
        correct_image_capabilities(oci.as_ref(), &settings.compartment, &image, arch).await?;
    }
    Ok(ids)
}

struct Management {
    kubeconfig: PathBuf,
    ephemeral: Option<Box<LibvirtDriver>>,
}

/// [`Driver`] for Cluster API clusters on OCI
pub struct OciDriver {
    config: ClusterConfig,
    show_ui: bool,
    lifecycle: Lifecycle,
    installer: Arc<dyn CapiInstaller>,
    oci: Arc<dyn OciClient>,
    inspector: Arc<dyn ImageInspector>,
    management: Option<Management>,
    kubeconfig: Option<PathBuf>,
}

impl std::fmt::Debug for OciDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciDriver")
            .field("cluster", &self.config.name)
            .field("state", &self.lifecycle.state())
            .field("kubeconfig", &self.kubeconfig)
            .finish()
    }
}

impl OciDriver {
    /// A driver using the `oci`, `skopeo` and `clusterctl` tools
    pub fn new(config: ClusterConfig, show_ui: bool) -> Self {
        let settings = &config.providers.oci;
        let oci = Arc::new(OciCli::new(settings.profile.clone(), Some(settings.region.clone())));
        Self::with_collaborators(
            config,
            show_ui,
            Arc::new(ClusterctlInstaller::default()),
            oci,
            Arc::new(SkopeoInspector),
        )
    }

    /// A driver with explicit collaborators
    pub fn with_collaborators(
        config: ClusterConfig,
        show_ui: bool,
        installer: Arc<dyn CapiInstaller>,
        oci: Arc<dyn OciClient>,
        inspector: Arc<dyn ImageInspector>,
    ) -> Self {
        let lifecycle = Lifecycle::new(config.name.clone());
        Self {
            config,
            show_ui,
            lifecycle,
            installer,
            oci,
            inspector,
            management: None,
            kubeconfig: None,
        }
    }

    /// Name and namespace of the Cluster object, taken from the cluster definition
    fn identity(&self) -> Result<ClusterIdentity> {
        ClusterIdentity::for_config(&self.config)
    }

    fn has_explicit_definition(&self) -> bool {
        self.config.cluster_definition.is_some() || self.config.cluster_definition_inline.is_some()
    }

    fn workload_kubeconfig(&self) -> Option<PathBuf> {
        self.kubeconfig.clone().or_else(|| self.config.kubeconfig.clone())
    }

    /// Kubeconfig of the management cluster
    ///
    /// With `create`, an ephemeral cluster is started if none is given.
    /// Without it, a missing ephemeral cluster yields `None`.
    async fn management_kubeconfig(&mut self, create: bool) -> Result<Option<PathBuf>> {
        if let Some(management) = &self.management {
            return Ok(Some(management.kubeconfig.clone()));
        }
        if let Some(path) = &self.config.providers.oci.management_kubeconfig {
            self.management = Some(Management {
                kubeconfig: path.clone(),
                ephemeral: None,
            });
            return Ok(Some(path.clone()));
        }

        let mut ephemeral = LibvirtDriver::connect(ephemeral_config(&self.config), self.show_ui).await?;
        if create {
            info!(cluster = EPHEMERAL_CLUSTER_NAME, "Starting ephemeral management cluster");
            ephemeral.start().await?;
        } else if !ephemeral.is_running().await? {
            return Ok(None);
        }
        let kubeconfig = ephemeral
            .kubeconfig_path()
            .ok_or_else(|| Error::not_found("kubeconfig", EPHEMERAL_CLUSTER_NAME))?;
        self.management = Some(Management {
            kubeconfig: kubeconfig.clone(),
            ephemeral: Some(Box::new(ephemeral)),
        });
        Ok(Some(kubeconfig))
    }

    /// Kubeconfig of the cluster holding this cluster's resources
    async fn resource_home(&mut self) -> Result<PathBuf> {
        if self.config.self_managed {
            return self.workload_kubeconfig().ok_or_else(|| {
                Error::precondition(
                    self.config.name.clone(),
                    "a self-managed cluster needs its kubeconfig",
                )
            });
        }
        self.management_kubeconfig(false).await?.ok_or_else(|| {
            Error::precondition(
                self.config.name.clone(),
                "no management cluster holds the cluster resources",
            )
        })
    }

    fn image_builder(&self, management: Client) -> Result<ImageBuilder> {
        let settings = &self.config.providers.oci;
        Ok(ImageBuilder::new(
            Arc::clone(&self.oci),
            Arc::clone(&self.inspector),
            Arc::new(PodImageConverter::new(management)),
            settings.compartment.clone(),
            settings.image_bucket.clone(),
            self.config.boot_volume_container_image.clone(),
            paths::images_dir()?,
        ))
    }

    /// Kubeconfig of a cluster that already exists and answers
    async fn existing_kubeconfig(&self, management: &Client, identity: &ClusterIdentity) -> Result<Option<PathBuf>> {
        let api = KubeClusterApi::new(management.clone());
        let name = &identity.name;
        if api
            .get(&identity.namespace, CAPI_API_VERSION, KIND_CLUSTER, name)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let Some(contents) = api.kubeconfig_secret(&identity.namespace, name).await? else {
            return Ok(None);
        };
        let path = write_memory_kubeconfig(&self.config.name, &contents)?;
        let client = create_client(Some(&path)).await?;
        if api_server_responds(&client).await {
            return Ok(Some(path));
        }
        remove_kubeconfig(&path);
        Ok(None)
    }

    async fn wait_for_nodes(&mut self, workload: Client) -> Result<()> {
        let name = self.config.name.clone();
        let client = workload.clone();
        let control_plane = Waiter::new(
            format!("Waiting for the control plane of {name}"),
            move |handle| async move {
                handle.set_message("listing nodes");
                kube_utils::wait_until_get_nodes_succeeds(&client).await?;
                Ok(())
            },
        );
        wait_for_all(vec![control_plane], self.show_ui).await?;
        self.lifecycle.advance(LifecycleState::ControlPlaneReady)?;
        self.lifecycle.advance(LifecycleState::WorkersJoining)?;

        let expected = self.config.control_plane_nodes + self.config.worker_nodes;
        let nodes_ready = Waiter::new(
            format!("Waiting for {expected} nodes of {name}"),
            move |handle| async move {
                let nodes: Api<Node> = Api::all(workload);
                let (nodes, handle) = (&nodes, &handle);
                poll_until(NODES_READY_TIMEOUT, DEFAULT_POLL_INTERVAL, "nodes to be ready", || async move {
                    let list = nodes.list(&ListParams::default()).await?;
                    let ready = list.items.iter().filter(|n| node_is_ready(n)).count();
                    handle.set_message(format!("{ready}/{expected} ready"));
                    Ok(ready >= expected as usize)
                })
                .await
            },
        );
        wait_for_all(vec![nodes_ready], self.show_ui).await?;
        self.lifecycle.advance(LifecycleState::Ready)
    }

    /// Move the resources of a self-managed cluster back to a management cluster
    async fn hand_back(&mut self, workload: &Path, identity: &ClusterIdentity) -> Result<PathBuf> {
        let management = self
            .management_kubeconfig(true)
            .await?
            .ok_or_else(|| Error::not_found("management cluster", EPHEMERAL_CLUSTER_NAME))?;
        self.installer.ensure(&management).await?;
        move_to_kubeconfig(workload, &management, &identity.namespace, &identity.name).await?;
        info!(cluster = %self.config.name, "Cluster resources moved back to the management cluster");
        Ok(management)
    }

    async fn bring_up(&mut self) -> Result<StartOutcome> {
        let identity = self.identity()?;
        let management = self
            .management_kubeconfig(true)
            .await?
            .ok_or_else(|| Error::not_found("management cluster", EPHEMERAL_CLUSTER_NAME))?;
        let client = create_client(Some(&management)).await?;
        if let Some(path) = self.existing_kubeconfig(&client, &identity).await? {
            info!(cluster = %identity.name, "Cluster is already running");
            self.kubeconfig = Some(path);
            self.lifecycle.observe_running();
            return Ok(StartOutcome {
                already_running: true,
                changed: false,
            });
        }

        self.lifecycle.advance(LifecycleState::Bootstrapping)?;
        self.installer.ensure(&management).await?;

        let images = if self.has_explicit_definition() {
            BTreeMap::new()
        } else {
            let builder = self.image_builder(client.clone())?;
            ensure_images(&self.config, Arc::clone(&self.oci), &builder, self.show_ui).await?
        };
        let definition = cluster_definition(&self.config, &images)?;
        let namespace = &identity.namespace;
        apply_manifests(&client, &with_namespace(namespace, &definition), namespace).await?;
        info!(cluster = %identity.name, namespace = %namespace, "Applied cluster resources");

        let contents =
            wait_for_kubeconfig_secret(&client, namespace, &identity.name, KUBECONFIG_SECRET_TIMEOUT).await?;
        let path = write_memory_kubeconfig(&self.config.name, &contents)?;
        self.kubeconfig = Some(path.clone());
        let workload = create_client(Some(&path)).await?;
        self.wait_for_nodes(workload).await?;

        info!(cluster = %identity.name, "Cluster is up");
        Ok(StartOutcome {
            already_running: false,
            changed: true,
        })
    }
}

fn remove_kubeconfig(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed kubeconfig"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove kubeconfig"),
    }
}

#[async_trait]
impl Driver for OciDriver {
    async fn start(&mut self) -> Result<StartOutcome> {
        let before = self.lifecycle.state();
        let result = self.bring_up().await;
        if result.is_err() {
            self.lifecycle.restore(before);
        }
        result
    }

    async fn post_start(&mut self) -> Result<()> {
        if !self.config.self_managed {
            debug!(cluster = %self.config.name, "Cluster is not self-managed, nothing to move");
            return Ok(());
        }
        let target = self.kubeconfig.clone().ok_or_else(|| {
            Error::precondition(self.config.name.clone(), "the cluster has not been started")
        })?;
        let source = self.management_kubeconfig(false).await?.ok_or_else(|| {
            Error::precondition(
                self.config.name.clone(),
                "no management cluster holds the cluster resources",
            )
        })?;
        if source == target {
            return Ok(());
        }

        let identity = self.identity()?;
        self.installer.ensure(&target).await?;
        move_to_kubeconfig(&source, &target, &identity.namespace, &identity.name).await?;
        info!(cluster = %self.config.name, "Cluster now manages itself");
        Ok(())
    }

    async fn join(&mut self, _kubeconfig: &Path, _control_planes: u32, _workers: u32) -> Result<()> {
        Err(Error::unsupported("join", DRIVER))
    }

    async fn stop(&mut self) -> Result<()> {
        Err(Error::unsupported("stop", DRIVER))
    }

    async fn delete(&mut self) -> Result<()> {
        self.lifecycle.advance(LifecycleState::Deleting)?;
        let identity = self.identity()?;
        let name = identity.name.clone();

        let management = match (self.config.self_managed, self.workload_kubeconfig()) {
            (true, Some(workload)) => Some(self.hand_back(&workload, &identity).await?),
            (true, None) => {
                return Err(Error::precondition(
                    name,
                    "deleting a self-managed cluster needs its kubeconfig",
                ))
            }
            (false, _) => self.management_kubeconfig(false).await?,
        };

        match management {
            Some(path) => {
                let client = create_client(Some(&path)).await?;
                delete_cluster(&client, &identity.namespace, &name).await?;
                wait_for_cluster_deletion(&client, &identity.namespace, &name, CLUSTER_DELETION_TIMEOUT).await?;
                info!(cluster = %name, "Deleted cluster");
            }
            None => info!(cluster = %name, "No management cluster, nothing to delete"),
        }

        if let Some(path) = self.kubeconfig.take() {
            remove_kubeconfig(&path);
        }
        self.lifecycle.advance(LifecycleState::Absent)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(ephemeral) = self.management.as_mut().and_then(|m| m.ephemeral.as_mut()) {
            ephemeral.close()?;
        }
        Ok(())
    }

    async fn stage(&mut self, version: &str) -> Result<StageOutcome> {
        let identity = self.identity()?;
        let home = self.resource_home().await?;
        let client = create_client(Some(&home)).await?;
        let images = Arc::new(self.image_builder(client.clone())?);
        let planner = StagePlanner::new(
            Arc::new(KubeClusterApi::new(client)),
            Arc::clone(&self.oci),
            images,
            Arc::clone(&self.inspector),
            self.config.boot_volume_container_image.clone(),
        );

        let settings = &self.config.providers.oci;
        let mut opts = StageOptions::new(
            identity.namespace,
            identity.name,
            version,
            settings.compartment.clone(),
            settings.image_name.clone(),
        );
        opts.show_ui = self.show_ui;
        let result = planner.stage(&opts).await?;

        self.lifecycle.observe_running();
        self.lifecycle.advance(LifecycleState::UpgradeStaged)?;
        self.kubeconfig = Some(result.kubeconfig.clone());
        Ok(StageOutcome {
            kubeconfig: result.kubeconfig,
            help_text: result.help_text,
            changed: result.changed,
        })
    }

    fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.workload_kubeconfig()
    }

    fn kube_api_server_address(&self) -> Result<String> {
        let path = self
            .workload_kubeconfig()
            .ok_or_else(|| Error::not_found("kubeconfig", &self.config.name))?;
        kube_utils::endpoint_from_server_url(&kube_utils::kubeconfig_server(&path)?)
    }

    fn post_install_help_stanza(&self) -> String {
        let mut help = match self.workload_kubeconfig() {
            Some(path) => format!("To access the cluster:\n    export KUBECONFIG={}\n", path.display()),
            None => String::new(),
        };
        if !self.config.self_managed {
            if let Some(management) = &self.management {
                let namespace = self
                    .identity()
                    .map(|i| i.namespace)
                    .unwrap_or_else(|_| self.config.providers.oci.namespace.clone());
                help.push_str(&format!(
                    "The cluster resources live in namespace {namespace} of the management cluster:\n    export KUBECONFIG={}\n",
                    management.kubeconfig.display()
                ));
            }
        }
        help
    }

    fn default_cni_interfaces(&self) -> Vec<String> {
        Vec::new()
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocne_capi::BuiltImage;
    use ocne_common::kube_utils::parse_manifests;

    mockall::mock! {
        pub Images {}

        #[async_trait]
        impl ImageProvider for Images {
            async fn ensure_image(
                &self,
                display_name: &str,
                arch: &str,
                version: &str,
                force: bool,
            ) -> Result<BuiltImage>;
        }
    }

    fn oci_config(worker_shape: &str) -> ClusterConfig {
        let mut config = ClusterConfig {
            name: "prod".to_string(),
            provider: ProviderKind::Oci,
            kubernetes_version: "1.31.2".to_string(),
            worker_nodes: 2,
            ..Default::default()
        };
        config.providers.oci.compartment = "ocid1.compartment.oc1..aaa".to_string();
        config.providers.oci.worker_shape.shape = worker_shape.to_string();
        config
    }

    #[test]
    fn ephemeral_cluster_is_a_single_hypervisor_node() {
        let mut config = oci_config("VM.Standard.E4.Flex");
        config.providers.libvirt.session_uri = "qemu:///system".to_string();
        config.self_managed = true;
        let ephemeral = ephemeral_config(&config);
        assert_eq!(ephemeral.name, EPHEMERAL_CLUSTER_NAME);
        assert_eq!(ephemeral.provider, ProviderKind::Libvirt);
        assert_eq!(ephemeral.control_plane_nodes, 1);
        assert_eq!(ephemeral.worker_nodes, 0);
        assert!(!ephemeral.self_managed);
        assert_eq!(ephemeral.kubernetes_version, "1.31.2");
        assert_eq!(ephemeral.providers.libvirt.session_uri, "qemu:///system");
        ephemeral.validate().unwrap();
    }

    #[test]
    fn namespace_is_applied_first() {
        let yaml = with_namespace("ocne", "apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata:\n  name: prod\n");
        let manifests = parse_manifests(&yaml).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].api_resource.kind, "Namespace");
        assert_eq!(manifests[0].name, "ocne");
        assert_eq!(manifests[1].api_resource.kind, "Cluster");
    }

    #[tokio::test]
    async fn story_existing_images_are_reused_per_architecture() {
        let config = oci_config("VM.Standard.A1.Flex");
        let mut images = MockImages::new();
        images
            .expect_ensure_image()
            .withf(|name, _, version, _| name == "ock" && version == "1.31.2")
            .times(2)
            .returning(|_, arch, _, _| {
                Ok(BuiltImage {
                    image_id: format!("ocid1.image.{arch}"),
                    work_request_id: None,
                })
            });

        let oci: Arc<dyn OciClient> = Arc::new(OciCli::new("DEFAULT", None));
        let ids = ensure_images(&config, oci, &images, false).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids["amd64"], "ocid1.image.amd64");
        assert_eq!(ids["arm64"], "ocid1.image.arm64");
    }

    #[tokio::test]
    async fn image_failures_stop_the_bring_up() {
        let config = oci_config("VM.Standard.E4.Flex");
        let mut images = MockImages::new();
        images
            .expect_ensure_image()
            .times(1)
            .returning(|_, _, _, _| Err(Error::not_found("boot image", "ock:1.31")));

        let oci: Arc<dyn OciClient> = Arc::new(OciCli::new("DEFAULT", None));
        let err = ensure_images(&config, oci, &images, false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn cluster_is_named_by_its_definition() {
        let mut config = oci_config("VM.Standard.E4.Flex");
        config.providers.oci.namespace = "ocne".to_string();
        config.cluster_definition_inline = Some(
            "apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata:\n  name: payments\n  namespace: team-a\n"
                .to_string(),
        );
        let identity = OciDriver::new(config.clone(), false).identity().unwrap();
        assert_eq!(identity.name, "payments");
        assert_eq!(identity.namespace, "team-a");

        config.cluster_definition_inline = None;
        let identity = OciDriver::new(config, false).identity().unwrap();
        assert_eq!(identity.name, "prod");
        assert_eq!(identity.namespace, "ocne");
    }

    #[test]
    fn fresh_driver_knows_no_cluster_yet() {
        let driver = OciDriver::new(oci_config("VM.Standard.E4.Flex"), false);
        assert_eq!(driver.state(), LifecycleState::Absent);
        assert!(driver.kubeconfig_path().is_none());
        assert!(driver.kube_api_server_address().unwrap_err().is_not_found());
        assert!(driver.default_cni_interfaces().is_empty());
    }
}
