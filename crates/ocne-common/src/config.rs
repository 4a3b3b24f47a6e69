//! Cluster configuration model
//!
//! A [`ClusterConfig`] is the declarative input every driver works from. It is
//! read once from YAML (optionally layered over a defaults document named by
//! `OCNE_DEFAULTS`), validated, and then shared immutably by the driver tree.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, ENV_DEFAULTS};

/// Default kubernetes version when the configuration does not name one
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.31";
/// Default boot image repository; the tag is the kubernetes version
pub const DEFAULT_BOOT_IMAGE: &str = "container-registry.oracle.com/olcne/ock";
/// Default ostree registry used for node updates
pub const DEFAULT_OS_REGISTRY: &str = "container-registry.oracle.com/olcne/ock-ostree";
/// Default API server port inside the VMs
pub const DEFAULT_KUBE_API_PORT: u16 = 6443;
/// Default pod subnet
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";
/// Default service subnet
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";
/// Default namespace for declarative cluster resources
pub const DEFAULT_CAPI_NAMESPACE: &str = "ocne";

/// Which provisioning backend drives the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local hypervisor virtual machines
    #[default]
    Libvirt,
    /// Public cloud compute through the declarative cluster-management API
    Oci,
    /// An existing cluster managed out of band
    None,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Libvirt => write!(f, "libvirt"),
            Self::Oci => write!(f, "oci"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Subject fields for the cluster CA
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CertificateInformation {
    /// Country (C)
    pub country: String,
    /// Organization (O)
    pub org: String,
    /// Organizational unit (OU)
    pub org_unit: String,
    /// State or province (ST)
    pub state: String,
}

impl Default for CertificateInformation {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            org: "ocne".to_string(),
            org_unit: "ocne".to_string(),
            state: "TX".to_string(),
        }
    }
}

/// Proxy settings folded into node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Proxy {
    /// HTTP proxy URL
    pub http_proxy: Option<String>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Comma separated hosts that bypass the proxy
    pub no_proxy: Option<String>,
}

impl Proxy {
    /// True if no proxy variable is set
    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none() && self.no_proxy.is_none()
    }

    /// Merge another proxy stanza over this one; set fields in `other` win
    pub fn merged(&self, other: &Proxy) -> Proxy {
        Proxy {
            http_proxy: other.http_proxy.clone().or_else(|| self.http_proxy.clone()),
            https_proxy: other.https_proxy.clone().or_else(|| self.https_proxy.clone()),
            no_proxy: other.no_proxy.clone().or_else(|| self.no_proxy.clone()),
        }
    }
}

/// Sizing of a hypervisor node
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Node {
    /// Virtual CPUs
    pub cpu: u32,
    /// Memory, e.g. "16Gi"
    pub memory: String,
    /// Root disk size, e.g. "8Gi"
    pub storage: String,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            cpu: 2,
            memory: "16Gi".to_string(),
            storage: "8Gi".to_string(),
        }
    }
}

/// Hypervisor provider configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LibvirtConfig {
    /// Hypervisor session URI (e.g. `qemu:///session`, `qemu+ssh://user@host/system`)
    pub session_uri: String,
    /// Storage pool name
    pub storage_pool: String,
    /// Network name
    pub network: String,
    /// Host bridge to attach nodes to, if any
    pub bridge: Option<String>,
    /// Control plane node sizing
    pub control_plane_node: Node,
    /// Worker node sizing
    pub worker_node: Node,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            session_uri: "qemu:///session".to_string(),
            storage_pool: "images".to_string(),
            network: "default".to_string(),
            bridge: None,
            control_plane_node: Node::default(),
            worker_node: Node::default(),
        }
    }
}

/// Compute shape for a cloud node pool
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OciShape {
    /// Shape name, e.g. "VM.Standard.E4.Flex" or "VM.Standard.A1.Flex"
    pub shape: String,
    /// OCPUs for flex shapes
    pub ocpus: u32,
    /// Boot volume size in GB
    pub boot_volume_size: u32,
}

impl Default for OciShape {
    fn default() -> Self {
        Self {
            shape: "VM.Standard.E4.Flex".to_string(),
            ocpus: 2,
            boot_volume_size: 50,
        }
    }
}

/// Load balancer subnets for the cloud control plane
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OciLoadBalancer {
    /// First subnet
    pub subnet1: String,
    /// Second subnet
    pub subnet2: String,
}

/// Declarative-cloud provider configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OciConfig {
    /// CLI profile holding credentials
    pub profile: String,
    /// Region, e.g. "us-ashburn-1"
    pub region: String,
    /// Compartment OCID
    pub compartment: String,
    /// VCN OCID; empty lets the infrastructure provider create one
    pub vcn: String,
    /// Load balancer subnets
    pub load_balancer: OciLoadBalancer,
    /// Object storage bucket used for image uploads
    pub image_bucket: String,
    /// Display name for uploaded node images
    pub image_name: String,
    /// Control plane shape
    pub control_plane_shape: OciShape,
    /// Worker shape
    pub worker_shape: OciShape,
    /// Namespace holding the cluster resources on the management cluster
    pub namespace: String,
    /// Existing management cluster kubeconfig; an ephemeral one is started otherwise
    pub management_kubeconfig: Option<PathBuf>,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            profile: "DEFAULT".to_string(),
            region: String::new(),
            compartment: String::new(),
            vcn: String::new(),
            load_balancer: OciLoadBalancer::default(),
            image_bucket: "ocne-images".to_string(),
            image_name: "ock".to_string(),
            control_plane_shape: OciShape::default(),
            worker_shape: OciShape::default(),
            namespace: DEFAULT_CAPI_NAMESPACE.to_string(),
            management_kubeconfig: None,
        }
    }
}

/// Provider sub-configurations; only the one matching [`ClusterConfig::provider`] is used
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Providers {
    /// Hypervisor settings
    pub libvirt: LibvirtConfig,
    /// Cloud settings
    pub oci: OciConfig,
}

/// The declarative description of a cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Provisioning backend
    pub provider: ProviderKind,
    /// Kubernetes version, e.g. "1.30" or "1.30.3"
    pub kubernetes_version: String,
    /// Container image holding the boot disk; tagged by kubernetes version
    pub boot_volume_container_image: String,
    /// Registry holding ostree update images
    pub os_registry: String,
    /// Tag of the ostree update image; defaults to the kubernetes version
    pub os_tag: Option<String>,
    /// CNI to install ("flannel", "none", ...)
    pub cni: String,
    /// Pod subnet
    pub pod_subnet: String,
    /// Service subnet
    pub service_subnet: String,
    /// Control plane node count
    pub control_plane_nodes: u32,
    /// Worker node count
    pub worker_nodes: u32,
    /// Move the cluster-management objects into the workload cluster after start
    pub self_managed: bool,
    /// External load balancer address for the API server
    pub load_balancer: Option<String>,
    /// API server port inside the nodes
    pub kube_api_server_bind_port: u16,
    /// Provider sub-configurations
    pub providers: Providers,
    /// CA subject
    pub certificate_information: CertificateInformation,
    /// Proxy settings
    pub proxy: Proxy,
    /// Directory for generated files; `~/.ocne` when unset
    pub working_directory: Option<PathBuf>,
    /// Explicit cluster-definition document for the declarative-cloud driver
    pub cluster_definition: Option<PathBuf>,
    /// Inline cluster-definition document
    pub cluster_definition_inline: Option<String>,
    /// Kubeconfig of an existing cluster (headless driver)
    pub kubeconfig: Option<PathBuf>,
    /// SSH public key installed for the node user
    pub ssh_public_key: Option<String>,
    /// Password hash for the node user
    pub password: Option<String>,
    /// Path to extra ignition merged into every node
    pub extra_ignition: Option<PathBuf>,
    /// Inline extra ignition merged into every node
    pub extra_ignition_inline: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "ocne".to_string(),
            provider: ProviderKind::default(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            boot_volume_container_image: DEFAULT_BOOT_IMAGE.to_string(),
            os_registry: DEFAULT_OS_REGISTRY.to_string(),
            os_tag: None,
            cni: "flannel".to_string(),
            pod_subnet: DEFAULT_POD_SUBNET.to_string(),
            service_subnet: DEFAULT_SERVICE_SUBNET.to_string(),
            control_plane_nodes: 1,
            worker_nodes: 0,
            self_managed: false,
            load_balancer: None,
            kube_api_server_bind_port: DEFAULT_KUBE_API_PORT,
            providers: Providers::default(),
            certificate_information: CertificateInformation::default(),
            proxy: Proxy::default(),
            working_directory: None,
            cluster_definition: None,
            cluster_definition_inline: None,
            kubeconfig: None,
            ssh_public_key: None,
            password: None,
            extra_ignition: None,
            extra_ignition_inline: None,
        }
    }
}

impl ClusterConfig {
    /// Load a configuration file, layering it over `OCNE_DEFAULTS` when set
    pub fn load(path: &Path) -> Result<Self> {
        let defaults = match std::env::var(ENV_DEFAULTS) {
            Ok(p) if !p.is_empty() => Some(read_yaml_value(Path::new(&p))?),
            _ => None,
        };
        let overlay = read_yaml_value(path)?;
        let merged = match defaults {
            Some(mut base) => {
                merge_yaml(&mut base, overlay);
                base
            }
            None => overlay,
        };
        let config: ClusterConfig = serde_yaml::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ClusterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every driver relies on
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation_for_field("name", "cluster name is required"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::validation_for_field(
                "name",
                format!("cluster name {} must be lowercase alphanumeric or '-'", self.name),
            ));
        }
        crate::version::KubeVersion::parse(&self.kubernetes_version)
            .map_err(|e| Error::validation_for_field("kubernetesVersion", e.to_string()))?;
        if self.control_plane_nodes == 0 {
            return Err(Error::validation_for_field(
                "controlPlaneNodes",
                "control plane count must be at least 1",
            ));
        }

        match self.provider {
            ProviderKind::Oci => {
                if self.worker_nodes == 0 {
                    return Err(Error::validation_for_field(
                        "workerNodes",
                        "the oci provider requires at least one worker",
                    ));
                }
                let has_definition =
                    self.cluster_definition.is_some() || self.cluster_definition_inline.is_some();
                if self.providers.oci.compartment.is_empty() && !has_definition {
                    return Err(Error::validation_for_field(
                        "providers.oci.compartment",
                        "a compartment is required",
                    ));
                }
            }
            ProviderKind::None => {
                if self.kubeconfig.is_none() {
                    return Err(Error::validation_for_field(
                        "kubeconfig",
                        "the none provider requires a kubeconfig for an existing cluster",
                    ));
                }
            }
            ProviderKind::Libvirt => {
                if self.providers.libvirt.session_uri.is_empty() {
                    return Err(Error::validation_for_field(
                        "providers.libvirt.sessionUri",
                        "a session URI is required",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Boot image reference tagged with the kubernetes version
    pub fn boot_image_ref(&self) -> String {
        boot_image_for_version(&self.boot_volume_container_image, &self.kubernetes_version)
    }

    /// Tag for the ostree update image
    pub fn os_tag(&self) -> &str {
        self.os_tag.as_deref().unwrap_or(&self.kubernetes_version)
    }

    /// Directory for generated state
    pub fn working_directory(&self) -> Result<PathBuf> {
        match &self.working_directory {
            Some(dir) => Ok(dir.clone()),
            None => crate::paths::ocne_dir(),
        }
    }

    /// Read the extra ignition, from path or inline, if configured
    pub fn extra_ignition(&self) -> Result<Option<String>> {
        if let Some(inline) = &self.extra_ignition_inline {
            return Ok(Some(inline.clone()));
        }
        match &self.extra_ignition {
            Some(path) => Ok(Some(std::fs::read_to_string(path).map_err(|e| {
                Error::validation_for_field(
                    "extraIgnition",
                    format!("failed to read {}: {}", path.display(), e),
                )
            })?)),
            None => Ok(None),
        }
    }
}

/// Replace or append the tag on an image reference
pub fn boot_image_for_version(image: &str, version: &str) -> String {
    let repo = strip_tag(image);
    format!("{repo}:{version}")
}

/// Remove a trailing `:tag` while leaving registry ports alone
pub fn strip_tag(image: &str) -> &str {
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[..idx],
        _ => image,
    }
}

fn read_yaml_value(path: &Path) -> Result<serde_yaml::Value> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        Error::validation(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&data)
        .map_err(|e| Error::serialization(format!("failed to parse {}: {}", path.display(), e)))
}

/// Deep-merge `overlay` into `base`; mappings merge key by key, everything else replaces
pub fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base, serde_yaml::Value::Null) => {
            let _ = base;
        }
        (base, overlay) => *base = overlay,
    }
}
