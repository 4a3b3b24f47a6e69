//! Hypervisor cluster provisioning
//!
//! A cluster is a set of domains named `<cluster>-<role>-<ordinal>`, each
//! booting a copy-on-write overlay of a shared boot volume and an ignition
//! volume of its own. The first control plane node initialises the cluster
//! with a locally generated CA; every later node joins with a token minted
//! against the live cluster.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use ocne_common::config::{boot_image_for_version, Node};
use ocne_common::image::{ImageInspector, SkopeoInspector};
use ocne_common::kube_utils::{self, create_client};
use ocne_common::waiter::{wait_for_all, Waiter};
use ocne_common::{paths, ClusterConfig, Error, KubeVersion, Result};
use ocne_pki::{
    cert_hashes_from_kubeconfig, create_join_token, generate_certificate_key, generate_pki,
    upload_certificates, JoinToken, KubeconfigRequest, PkiBundle,
};

use crate::accounting::NetworkAccounting;
use crate::hypervisor::{Hypervisor, VirshHypervisor};
use crate::ignition::{proxy_from_env, Bootstrap, NetworkInterface, NodeIgnition, StaticAddress};
use crate::pool::{default_pool_path, ensure_pool, find_pool};
use crate::uri::SessionUri;
use crate::xml::{
    host_arch, parse_quantity, DomainSpec, InterfaceKind, InterfaceSpec, NetworkInfo, VolumeSpec,
};

/// Address user-networked guests reach the hypervisor host on
pub const USER_NETWORK_HOST: &str = "10.0.2.2";

/// Provider suffix of boot volume names
pub const PROVIDER_SUFFIX: &str = "libvirt";

/// Role of a node in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRole {
    /// Runs the API server and etcd
    ControlPlane,
    /// Runs workloads
    Worker,
}

impl NodeRole {
    /// Role as it appears in domain names
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<cluster>-<role>-<ordinal>`
pub fn domain_name(cluster: &str, role: NodeRole, ordinal: u32) -> String {
    format!("{cluster}-{}-{ordinal}", role.as_str())
}

/// Ordinal of `domain` if it is a `role` node of `cluster`
pub fn domain_ordinal(cluster: &str, role: NodeRole, domain: &str) -> Option<u32> {
    domain
        .strip_prefix(cluster)?
        .strip_prefix('-')?
        .strip_prefix(role.as_str())?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// First unused ordinal for `role` among `domains`
pub fn next_ordinal(cluster: &str, role: NodeRole, domains: &[String]) -> u32 {
    domains
        .iter()
        .filter_map(|d| domain_ordinal(cluster, role, d))
        .max()
        .map_or(1, |max| max + 1)
}

fn is_cluster_domain(cluster: &str, domain: &str) -> bool {
    [NodeRole::ControlPlane, NodeRole::Worker]
        .into_iter()
        .any(|role| domain_ordinal(cluster, role, domain).is_some())
}

fn is_cluster_volume(cluster: &str, volume: &str) -> bool {
    let stem = volume.rsplit_once('.').map_or(volume, |(stem, _)| stem);
    is_cluster_domain(cluster, stem)
}

/// Architecture name used for container images on this host
pub fn image_arch() -> &'static str {
    match host_arch() {
        "aarch64" => "arm64",
        _ => "amd64",
    }
}

/// Name of the shared boot volume for a kubernetes version
pub fn boot_volume_name(version: &str, arch: &str) -> String {
    let tag = KubeVersion::parse(version)
        .map(|v| v.minor_string())
        .unwrap_or_else(|_| version.to_string());
    paths::cached_image_name(&tag, arch, PROVIDER_SUFFIX)
}

/// What [`Provisioner::start`] found and did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// The cluster was already up
    pub already_running: bool,
    /// Something was created
    pub changed: bool,
}

/// Where the API server of a new cluster lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// In-VM address
    pub ip: Ipv4Addr,
    /// Host port reserved for the cluster
    pub port: u16,
    /// Static address given to the first control plane node
    pub address: Option<StaticAddress>,
}

#[derive(Clone, Debug)]
struct NodeRequest {
    role: NodeRole,
    ordinal: u32,
    endpoint: String,
    bootstrap: Bootstrap,
    address: Option<StaticAddress>,
    forward_port: Option<u16>,
}

/// Creates and tears down clusters on one hypervisor
pub struct Provisioner {
    config: ClusterConfig,
    uri: SessionUri,
    hypervisor: Arc<dyn Hypervisor>,
    inspector: Arc<dyn ImageInspector>,
    accounting: NetworkAccounting,
    kubeconfig_dir: PathBuf,
    show_ui: bool,
    pki: Option<PkiBundle>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("cluster", &self.config.name)
            .field("uri", &self.uri)
            .finish()
    }
}

impl Provisioner {
    /// A provisioner with explicit collaborators
    pub fn new(
        config: ClusterConfig,
        uri: SessionUri,
        hypervisor: Arc<dyn Hypervisor>,
        inspector: Arc<dyn ImageInspector>,
        accounting: NetworkAccounting,
        kubeconfig_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            uri,
            hypervisor,
            inspector,
            accounting,
            kubeconfig_dir,
            show_ui: false,
            pki: None,
        }
    }

    /// A provisioner driving `virsh` against the configured session URI
    pub async fn connect(config: ClusterConfig) -> Result<Self> {
        let uri = SessionUri::resolve(&config.providers.libvirt.session_uri).await?;
        let hypervisor = Arc::new(VirshHypervisor::new(uri.as_str()));
        let kubeconfig_dir = config.working_directory()?;
        Ok(Self::new(
            config,
            uri,
            hypervisor,
            Arc::new(SkopeoInspector),
            NetworkAccounting::default_location()?,
            kubeconfig_dir,
        ))
    }

    /// Render progress bars while waiting
    pub fn with_ui(mut self, show_ui: bool) -> Self {
        self.show_ui = show_ui;
        self
    }

    /// The cluster configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The hypervisor connection
    pub fn uri(&self) -> &SessionUri {
        &self.uri
    }

    /// Kubeconfig reaching the cluster from this machine
    pub fn kubeconfig_path(&self) -> PathBuf {
        paths::local_kubeconfig(&self.kubeconfig_dir, &self.config.name)
    }

    /// Kubeconfig reaching the cluster on its in-VM address
    pub fn vm_kubeconfig_path(&self) -> PathBuf {
        paths::vm_kubeconfig(&self.kubeconfig_dir, &self.config.name)
    }

    /// API server address of the cluster
    pub fn api_server_address(&self) -> Result<String> {
        if let Some(lb) = &self.config.load_balancer {
            return Ok(lb.clone());
        }
        self.accounting
            .cluster(&self.config.name)?
            .map(|a| a.ip.to_string())
            .ok_or_else(|| Error::not_found("cluster endpoint", &self.config.name))
    }

    fn uses_user_network(&self) -> bool {
        self.uri.is_session() || !self.uri.is_local()
    }

    fn sizing(&self, role: NodeRole) -> &Node {
        match role {
            NodeRole::ControlPlane => &self.config.providers.libvirt.control_plane_node,
            NodeRole::Worker => &self.config.providers.libvirt.worker_node,
        }
    }

    fn pool_path(&self) -> PathBuf {
        default_pool_path(
            &self.uri,
            cfg!(target_os = "macos"),
            dirs::home_dir().as_deref(),
        )
    }

    async fn cluster_domains(&self) -> Result<Vec<String>> {
        Ok(self
            .hypervisor
            .list_domains()
            .await?
            .into_iter()
            .filter(|d| is_cluster_domain(&self.config.name, d))
            .collect())
    }

    /// True if the first control plane exists and its API server answers
    pub async fn is_running(&self) -> Result<bool> {
        let first = domain_name(&self.config.name, NodeRole::ControlPlane, 1);
        if !self.hypervisor.list_domains().await?.contains(&first) {
            return Ok(false);
        }
        let kubeconfig = self.kubeconfig_path();
        if !kubeconfig.exists() {
            debug!(domain = %first, "Domain exists but the kubeconfig is missing");
            return Ok(false);
        }
        match create_client(Some(&kubeconfig)).await {
            Ok(client) => Ok(kube_utils::api_server_responds(&client).await),
            Err(e) => {
                debug!(error = %e, "Could not build a client for the existing cluster");
                Ok(false)
            }
        }
    }

    /// Reserve a host port and, on routed networks, an address for the API server
    ///
    /// The endpoint is recorded against the cluster as it is reserved, so a
    /// failed start is released by `delete` and a retried start reuses it.
    pub async fn reserve_endpoint(&self) -> Result<ApiEndpoint> {
        let host = self.uri.accounting_host();
        let name = &self.config.name;
        if self.uri.is_session() {
            let alloc = self.accounting.reserve_cluster(&host, name, None).await?;
            return Ok(ApiEndpoint {
                ip: Ipv4Addr::LOCALHOST,
                port: alloc.port,
                address: None,
            });
        }

        let network = &self.config.providers.libvirt.network;
        let info = NetworkInfo::from_xml(&self.hypervisor.network_xml(network).await?)?;
        let alloc = self.accounting.reserve_cluster(&host, name, Some(&info)).await?;
        Ok(ApiEndpoint {
            ip: alloc.ip,
            port: alloc.port,
            address: Some(StaticAddress {
                ip: alloc.ip,
                prefix: info.subnet.prefix(),
                gateway: info.gateway,
            }),
        })
    }

    fn join_endpoint(&self, endpoint: &ApiEndpoint) -> String {
        if self.uri.is_session() {
            format!("{USER_NETWORK_HOST}:{}", endpoint.port)
        } else {
            format!("{}:{}", endpoint.ip, self.config.kube_api_server_bind_port)
        }
    }

    fn kubeconfig_requests(&self, endpoint: &ApiEndpoint) -> (KubeconfigRequest, KubeconfigRequest) {
        let name = &self.config.name;
        let bind_port = self.config.kube_api_server_bind_port;
        let vm = KubeconfigRequest::new(self.vm_kubeconfig_path(), name, endpoint.ip.to_string(), bind_port);
        let local_path = self.kubeconfig_path();
        let local = match &self.config.load_balancer {
            Some(lb) => KubeconfigRequest::new(local_path, name, lb, bind_port),
            None if self.uses_user_network() => {
                KubeconfigRequest::new(local_path, name, self.uri.host_address(), endpoint.port)
            }
            None => KubeconfigRequest::new(local_path, name, endpoint.ip.to_string(), bind_port),
        };
        (vm, local)
    }

    fn cert_sans(&self, endpoint: &ApiEndpoint) -> Vec<String> {
        let mut sans = vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            endpoint.ip.to_string(),
            self.uri.host_address(),
        ];
        if self.uri.is_session() {
            sans.push(USER_NETWORK_HOST.to_string());
        }
        if let Some(lb) = &self.config.load_balancer {
            sans.push(lb.clone());
        }
        sans.sort();
        sans.dedup();
        sans
    }

    /// Bring the cluster up
    ///
    /// Returns early if the first control plane already answers. Otherwise
    /// runs [`Provisioner::start_first_control_plane`] and then
    /// [`Provisioner::join_remaining`].
    pub async fn start(&mut self) -> Result<StartOutcome> {
        if self.is_running().await? {
            info!(cluster = %self.config.name, "Cluster is already running");
            return Ok(StartOutcome {
                already_running: true,
                changed: false,
            });
        }
        let join_endpoint = self.start_first_control_plane().await?;
        self.join_remaining(&join_endpoint).await?;
        Ok(StartOutcome {
            already_running: false,
            changed: true,
        })
    }

    /// Reserve and record the API endpoint, generate the PKI, boot the first
    /// control plane node and wait for the node list
    ///
    /// Returns the address further nodes join through.
    pub async fn start_first_control_plane(&mut self) -> Result<String> {
        let name = self.config.name.clone();
        paths::ensure_dir(&self.kubeconfig_dir)?;
        let endpoint = self.reserve_endpoint().await?;
        let (vm, local) = self.kubeconfig_requests(&endpoint);
        let pki = generate_pki(&self.config.certificate_information, &vm, &local)?;
        let token = JoinToken::generate()?;
        let join_endpoint = self.join_endpoint(&endpoint);

        let bootstrap = Bootstrap::Init {
            token: token.to_string(),
            ca_cert_pem: pki.ca.ca_cert_pem().to_string(),
            ca_key_pem: pki.ca.ca_key_pem().to_string(),
            cert_sans: self.cert_sans(&endpoint),
        };
        self.pki = Some(pki);

        info!(cluster = %name, uri = %self.uri, "Creating cluster");
        self.add_node(&NodeRequest {
            role: NodeRole::ControlPlane,
            ordinal: 1,
            endpoint: join_endpoint.clone(),
            bootstrap,
            address: endpoint.address,
            forward_port: Some(endpoint.port),
        })
        .await?;

        self.wait_for_cluster(&self.kubeconfig_path()).await?;
        Ok(join_endpoint)
    }

    /// Add the configured control plane and worker nodes after the first, one
    /// at a time
    pub async fn join_remaining(&mut self, join_endpoint: &str) -> Result<()> {
        let kubeconfig = self.kubeconfig_path();
        let control_planes: Vec<u32> = (2..=self.config.control_plane_nodes).collect();
        let workers: Vec<u32> = (1..=self.config.worker_nodes).collect();
        self.join_nodes(&kubeconfig, join_endpoint, &control_planes, &workers)
            .await?;
        info!(cluster = %self.config.name, "Cluster is up");
        Ok(())
    }

    async fn wait_for_cluster(&self, kubeconfig: &Path) -> Result<()> {
        let client = create_client(Some(kubeconfig)).await?;
        let waiter = Waiter::new(
            format!("Waiting for the Kubernetes cluster {}", self.config.name),
            move |handle| async move {
                handle.set_message("listing nodes");
                kube_utils::wait_until_get_nodes_succeeds(&client).await?;
                Ok(())
            },
        );
        wait_for_all(vec![waiter], self.show_ui).await?;
        Ok(())
    }

    /// Add nodes to a running cluster reached through `kubeconfig`
    pub async fn join(&mut self, kubeconfig: &Path, control_planes: u32, workers: u32) -> Result<()> {
        let client = create_client(Some(kubeconfig)).await?;
        let endpoint = kube_utils::get_control_plane_endpoint(&client, kubeconfig).await?;
        let domains = self.hypervisor.list_domains().await?;

        let name = &self.config.name;
        let first_cp = next_ordinal(name, NodeRole::ControlPlane, &domains);
        let first_worker = next_ordinal(name, NodeRole::Worker, &domains);
        let control_planes: Vec<u32> = (first_cp..first_cp + control_planes).collect();
        let workers: Vec<u32> = (first_worker..first_worker + workers).collect();

        info!(
            cluster = %name,
            endpoint = %endpoint,
            control_planes = control_planes.len(),
            workers = workers.len(),
            "Joining nodes"
        );
        self.join_nodes(kubeconfig, &endpoint, &control_planes, &workers)
            .await
    }

    async fn join_nodes(
        &self,
        kubeconfig: &Path,
        endpoint: &str,
        control_planes: &[u32],
        workers: &[u32],
    ) -> Result<()> {
        if control_planes.is_empty() && workers.is_empty() {
            return Ok(());
        }

        let ca_cert_hashes = cert_hashes_from_kubeconfig(kubeconfig)?;
        let certificate_key = if control_planes.is_empty() {
            None
        } else {
            let key = generate_certificate_key()?;
            upload_certificates(kubeconfig, &key).await?;
            Some(key)
        };

        let nodes = control_planes
            .iter()
            .map(|o| (NodeRole::ControlPlane, *o))
            .chain(workers.iter().map(|o| (NodeRole::Worker, *o)));
        for (role, ordinal) in nodes {
            let token = create_join_token(kubeconfig, false).await?;
            let certificate_key = match role {
                NodeRole::ControlPlane => certificate_key.clone(),
                NodeRole::Worker => None,
            };
            self.add_node(&NodeRequest {
                role,
                ordinal,
                endpoint: endpoint.to_string(),
                bootstrap: Bootstrap::Join {
                    token: token.to_string(),
                    ca_cert_hashes: ca_cert_hashes.clone(),
                    certificate_key,
                },
                address: None,
                forward_port: None,
            })
            .await?;
        }
        Ok(())
    }

    /// Device names the node network interfaces get inside the guest
    pub fn guest_devices(&self) -> Vec<String> {
        self.interfaces(None).iter().map(InterfaceSpec::guest_device).collect()
    }

    fn interfaces(&self, forward_port: Option<u16>) -> Vec<InterfaceSpec> {
        let libvirt = &self.config.providers.libvirt;
        let mut kinds = Vec::new();
        if self.uses_user_network() {
            kinds.push(InterfaceKind::User { forward_port });
        }
        if !self.uri.is_session() {
            kinds.push(InterfaceKind::Network(libvirt.network.clone()));
        }
        if let Some(bridge) = &libvirt.bridge {
            kinds.push(InterfaceKind::Bridge(bridge.clone()));
        }
        kinds
            .into_iter()
            .zip(1u8..)
            .map(|(kind, bus)| InterfaceSpec { kind, bus, slot: 0 })
            .collect()
    }

    async fn replace_volume(&self, pool: &str, existing: &[String], volume: &VolumeSpec) -> Result<String> {
        if existing.contains(&volume.name) {
            debug!(pool, volume = %volume.name, "Replacing stale volume");
            self.hypervisor.delete_volume(pool, &volume.name).await?;
        }
        self.hypervisor.create_volume(pool, &volume.to_xml()?).await?;
        self.hypervisor.volume_path(pool, &volume.name).await
    }

    async fn ensure_boot_volume(&self, pool: &str) -> Result<String> {
        let arch = image_arch();
        let name = boot_volume_name(&self.config.kubernetes_version, arch);
        if !self.hypervisor.list_volumes(pool).await?.contains(&name) {
            let tag = KubeVersion::parse(&self.config.kubernetes_version)?.minor_string();
            let image = boot_image_for_version(&self.config.boot_volume_container_image, &tag);
            let staging = tempfile::tempdir()?;
            let disk = staging.path().join("boot.qcow2");
            info!(image = %image, arch, volume = %name, "Materialising boot volume");
            self.inspector.extract_boot_disk(&image, arch, &disk).await?;

            let size = std::fs::metadata(&disk)?.len();
            self.hypervisor
                .create_volume(pool, &VolumeSpec::qcow2(&name, size).to_xml()?)
                .await?;
            self.hypervisor.upload_volume(pool, &name, &disk).await?;
        }
        self.hypervisor.volume_path(pool, &name).await
    }

    async fn upload_ignition(&self, pool: &str, existing: &[String], domain: &str, ignition: &str) -> Result<String> {
        let volume = VolumeSpec::raw(format!("{domain}.ign"), ignition.len() as u64);
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(ignition.as_bytes())?;
        let path = self.replace_volume(pool, existing, &volume).await?;
        self.hypervisor.upload_volume(pool, &volume.name, file.path()).await?;
        Ok(path)
    }

    async fn add_node(&self, req: &NodeRequest) -> Result<String> {
        let name = domain_name(&self.config.name, req.role, req.ordinal);
        let pool = ensure_pool(
            self.hypervisor.as_ref(),
            &self.config.providers.libvirt.storage_pool,
            &self.pool_path(),
        )
        .await?;
        let base = self.ensure_boot_volume(&pool).await?;
        let existing = self.hypervisor.list_volumes(&pool).await?;

        let sizing = self.sizing(req.role);
        let disk = VolumeSpec::qcow2(format!("{name}.qcow2"), parse_quantity(&sizing.storage)?)
            .backed_by(base);
        let disk_path = self.replace_volume(&pool, &existing, &disk).await?;

        let interfaces = self.interfaces(req.forward_port);
        let guest_interfaces = interfaces
            .iter()
            .map(|i| NetworkInterface {
                device: i.guest_device(),
                address: match i.kind {
                    InterfaceKind::Network(_) => req.address,
                    _ => None,
                },
            })
            .collect();
        let ignition = NodeIgnition {
            hostname: name.clone(),
            endpoint: req.endpoint.clone(),
            bootstrap: req.bootstrap.clone(),
            interfaces: guest_interfaces,
        }
        .render(&self.config, &proxy_from_env().merged(&self.config.proxy))?;
        let ignition_path = self.upload_ignition(&pool, &existing, &name, &ignition).await?;

        let domain = DomainSpec {
            name: name.clone(),
            memory_kib: parse_quantity(&sizing.memory)? / 1024,
            vcpus: sizing.cpu,
            arch: host_arch().to_string(),
            disk_path,
            ignition_path,
            interfaces,
        };
        self.hypervisor.define_domain(&domain.to_xml()?).await?;
        self.hypervisor.start_domain(&name).await?;
        info!(domain = %name, role = %req.role, "Started node");
        Ok(name)
    }

    /// Shut down every domain of the cluster
    pub async fn stop(&self) -> Result<()> {
        let mut failed = Vec::new();
        for domain in self.cluster_domains().await? {
            match self.hypervisor.shutdown_domain(&domain).await {
                Ok(()) => info!(domain = %domain, "Shutting down node"),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Failed to shut down node");
                    failed.push(domain);
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::fatal(format!("failed to shut down {}", failed.join(", "))))
        }
    }

    /// Remove every domain, volume, kubeconfig and accounting entry of the cluster
    ///
    /// Failures on individual resources are logged and skipped so that a
    /// partially deleted cluster can always be cleaned up.
    pub async fn delete(&mut self) -> Result<()> {
        let name = self.config.name.clone();
        for domain in self.cluster_domains().await? {
            if let Err(e) = self.hypervisor.destroy_domain(&domain).await {
                debug!(domain = %domain, error = %e, "Domain was not running");
            }
            match self.hypervisor.undefine_domain(&domain).await {
                Ok(()) => info!(domain = %domain, "Removed node"),
                Err(e) => warn!(domain = %domain, error = %e, "Failed to remove node"),
            }
        }

        let pool = find_pool(
            self.hypervisor.as_ref(),
            &self.config.providers.libvirt.storage_pool,
            &self.pool_path(),
        )
        .await;
        match pool {
            Ok(Some(pool)) => self.delete_volumes(&pool).await,
            Ok(None) => debug!(cluster = %name, "No storage pool to clean up"),
            Err(e) => warn!(cluster = %name, error = %e, "Failed to find storage pool"),
        }

        for path in [self.kubeconfig_path(), self.vm_kubeconfig_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed kubeconfig"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove kubeconfig"),
            }
        }

        if let Err(e) = self.accounting.remove_cluster(&name).await {
            warn!(cluster = %name, error = %e, "Failed to release network allocations");
        }
        info!(cluster = %name, "Deleted cluster");
        Ok(())
    }

    async fn delete_volumes(&self, pool: &str) {
        let volumes = match self.hypervisor.list_volumes(pool).await {
            Ok(v) => v,
            Err(e) => {
                warn!(pool, error = %e, "Failed to list volumes");
                return;
            }
        };
        for volume in volumes
            .iter()
            .filter(|v| is_cluster_volume(&self.config.name, v))
        {
            if let Err(e) = self.hypervisor.delete_volume(pool, volume).await {
                warn!(pool, volume = %volume, error = %e, "Failed to delete volume");
            }
        }
    }

    /// Release the PKI temp directory
    pub fn close(&mut self) -> Result<()> {
        if let Some(pki) = self.pki.take() {
            pki.close()?;
        }
        Ok(())
    }
}
