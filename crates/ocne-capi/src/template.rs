//! Built-in cluster resources for the declarative-cloud provider

use std::collections::BTreeMap;

use minijinja::Environment;
use serde::Serialize;

use ocne_common::config::{OciShape, Proxy};
use ocne_common::kube_utils::parse_manifests;
use ocne_common::{ClusterConfig, Error, Result};

use crate::shape::arch_from_shape;
use crate::{CAPI_API_VERSION, KIND_CLUSTER};

const CLUSTER_TEMPLATE: &str = include_str!("../templates/cluster.yaml.j2");

/// Machines of one pool
#[derive(Clone, Debug, Serialize)]
pub struct NodePool {
    /// Platform image the machines boot
    pub image_id: String,
    /// Compute shape
    pub shape: String,
    /// OCPUs for flex shapes
    pub ocpus: u32,
    /// Boot volume size in GB
    pub boot_volume_size: u32,
}

impl NodePool {
    fn new(shape: &OciShape, images: &BTreeMap<String, String>) -> Result<Self> {
        let arch = arch_from_shape(&shape.shape);
        let image_id = images
            .get(arch)
            .cloned()
            .ok_or_else(|| Error::not_found("image", format!("{arch} image for {}", shape.shape)))?;
        Ok(Self {
            image_id,
            shape: shape.shape.clone(),
            ocpus: shape.ocpus,
            boot_volume_size: shape.boot_volume_size,
        })
    }
}

/// Values rendered into the cluster resources
#[derive(Clone, Debug, Serialize)]
pub struct ClusterValues {
    /// Cluster name
    pub name: String,
    /// Namespace on the management cluster
    pub namespace: String,
    /// Kubernetes version, `v`-prefixed
    pub version: String,
    /// Compartment OCID
    pub compartment: String,
    /// Existing VCN, empty to let the provider create one
    pub vcn: String,
    /// Subnets for service load balancers
    pub lb_subnets: Vec<String>,
    /// Pod CIDR
    pub pod_subnet: String,
    /// Service CIDR
    pub service_subnet: String,
    /// Control plane replicas
    pub control_plane_nodes: u32,
    /// Worker replicas
    pub worker_nodes: u32,
    /// API server bind port
    pub bind_port: u16,
    /// SSH key for the node user, empty for none
    pub ssh_public_key: String,
    /// Proxy settings, if any are set
    pub proxy: Option<Proxy>,
    /// Control plane pool
    pub control_plane: NodePool,
    /// Worker pool
    pub worker: NodePool,
}

impl ClusterValues {
    /// Values for `config`, with `images` mapping architecture to image OCID
    pub fn from_config(config: &ClusterConfig, images: &BTreeMap<String, String>) -> Result<Self> {
        let oci = &config.providers.oci;
        let version = if config.kubernetes_version.starts_with('v') {
            config.kubernetes_version.clone()
        } else {
            format!("v{}", config.kubernetes_version)
        };
        let lb_subnets = [&oci.load_balancer.subnet1, &oci.load_balancer.subnet2]
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        Ok(Self {
            name: config.name.clone(),
            namespace: oci.namespace.clone(),
            version,
            compartment: oci.compartment.clone(),
            vcn: oci.vcn.clone(),
            lb_subnets,
            pod_subnet: config.pod_subnet.clone(),
            service_subnet: config.service_subnet.clone(),
            control_plane_nodes: config.control_plane_nodes,
            worker_nodes: config.worker_nodes,
            bind_port: config.kube_api_server_bind_port,
            ssh_public_key: config.ssh_public_key.clone().unwrap_or_default(),
            proxy: (!config.proxy.is_empty()).then(|| config.proxy.clone()),
            control_plane: NodePool::new(&oci.control_plane_shape, images)?,
            worker: NodePool::new(&oci.worker_shape, images)?,
        })
    }
}

/// Render the built-in cluster resources
pub fn render_cluster_resources(values: &ClusterValues) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("cluster", CLUSTER_TEMPLATE)
        .map_err(|e| Error::validation(format!("invalid cluster template: {e}")))?;
    env.get_template("cluster")
        .map_err(|e| Error::validation(format!("cluster template not found: {e}")))?
        .render(values)
        .map_err(|e| Error::serialization(format!("failed to render cluster template: {e}")))
}

/// An explicit cluster definition, from a file or inline
fn explicit_definition(config: &ClusterConfig) -> Result<Option<String>> {
    if let Some(inline) = &config.cluster_definition_inline {
        return Ok(Some(inline.clone()));
    }
    match &config.cluster_definition {
        Some(path) => std::fs::read_to_string(path).map(Some).map_err(|e| {
            Error::validation(format!(
                "failed to read cluster definition {}: {e}",
                path.display()
            ))
        }),
        None => Ok(None),
    }
}

/// Cluster resources for `config`
///
/// An explicit cluster definition, from a file or inline, wins over the
/// built-in template.
pub fn cluster_definition(config: &ClusterConfig, images: &BTreeMap<String, String>) -> Result<String> {
    match explicit_definition(config)? {
        Some(definition) => Ok(definition),
        None => render_cluster_resources(&ClusterValues::from_config(config, images)?),
    }
}

/// Name and namespace of the Cluster object a definition creates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIdentity {
    /// Cluster object name
    pub name: String,
    /// Namespace on the management cluster
    pub namespace: String,
}

impl ClusterIdentity {
    /// The Cluster object in `definition`
    ///
    /// A Cluster without a namespace lands in `default_namespace`.
    pub fn from_definition(definition: &str, default_namespace: &str) -> Result<Self> {
        let manifests = parse_manifests(definition)?;
        let cluster = manifests
            .iter()
            .find(|m| m.api_resource.kind == KIND_CLUSTER && m.api_resource.api_version == CAPI_API_VERSION)
            .ok_or_else(|| {
                Error::validation_for_field("clusterDefinition", "the cluster definition has no Cluster object")
            })?;
        Ok(Self {
            name: cluster.name.clone(),
            namespace: cluster
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
        })
    }

    /// The Cluster object `config` creates
    ///
    /// An explicit definition is read for it. The built-in resources carry
    /// the configured name and namespace.
    pub fn for_config(config: &ClusterConfig) -> Result<Self> {
        let namespace = &config.providers.oci.namespace;
        match explicit_definition(config)? {
            Some(definition) => Self::from_definition(&definition, namespace),
            None => Ok(Self {
                name: config.name.clone(),
                namespace: namespace.clone(),
            }),
        }
    }
}

/// Architectures the configured shapes need images for
pub fn required_architectures(config: &ClusterConfig) -> Vec<&'static str> {
    let oci = &config.providers.oci;
    let mut arches = vec![
        arch_from_shape(&oci.control_plane_shape.shape),
        arch_from_shape(&oci.worker_shape.shape),
    ];
    arches.sort_unstable();
    arches.dedup();
    arches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        let mut config = ClusterConfig {
            name: "demo".to_string(),
            kubernetes_version: "1.30.3".to_string(),
            control_plane_nodes: 3,
            worker_nodes: 2,
            ..Default::default()
        };
        config.providers.oci.compartment = "ocid1.compartment.c".to_string();
        config.providers.oci.worker_shape.shape = "VM.Standard.A1.Flex".to_string();
        config
    }

    fn images() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("amd64".to_string(), "img-amd".to_string()),
            ("arm64".to_string(), "img-arm".to_string()),
        ])
    }

    #[test]
    fn renders_every_resource() {
        let yaml = cluster_definition(&config(), &images()).unwrap();
        let manifests = parse_manifests(&yaml).unwrap();
        let kinds: Vec<_> = manifests.iter().map(|m| m.api_resource.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "Cluster",
                "OCICluster",
                "KubeadmControlPlane",
                "OCIMachineTemplate",
                "OCIMachineTemplate",
                "KubeadmConfigTemplate",
                "MachineDeployment",
            ]
        );
        assert!(yaml.contains("version: v1.30.3"));
        assert!(yaml.contains("replicas: 3"));
        assert!(yaml.contains("imageId: img-amd"));
        assert!(yaml.contains("imageId: img-arm"));
        assert!(yaml.contains(r#"provider-id: oci://{{ ds["id"] }}"#));
        assert!(!yaml.contains("networkSpec"));
    }

    #[test]
    fn existing_vcn_lists_service_lb_subnets() {
        let mut config = config();
        config.providers.oci.vcn = "ocid1.vcn.v".to_string();
        config.providers.oci.load_balancer.subnet1 = "ocid1.subnet.a".to_string();
        let yaml = cluster_definition(&config, &images()).unwrap();
        assert!(yaml.contains("skipNetworkManagement: true"));
        assert!(yaml.contains("- id: ocid1.subnet.a"));
        assert!(yaml.contains("role: service-lb"));
        parse_manifests(&yaml).unwrap();
    }

    #[test]
    fn proxy_is_written_for_the_runtime() {
        let mut config = config();
        config.proxy.https_proxy = Some("http://proxy:3128".to_string());
        let yaml = cluster_definition(&config, &images()).unwrap();
        assert!(yaml.contains("HTTPS_PROXY=http://proxy:3128"));
        assert!(!yaml.contains("HTTP_PROXY=none"));
    }

    #[test]
    fn inline_definition_wins() {
        let mut config = config();
        config.cluster_definition_inline = Some("kind: Cluster\n".to_string());
        assert_eq!(cluster_definition(&config, &images()).unwrap(), "kind: Cluster\n");
    }

    #[test]
    fn identity_comes_from_the_cluster_object() {
        let mut config = config();
        config.providers.oci.namespace = "ocne".to_string();
        config.cluster_definition_inline = Some(
            "apiVersion: infrastructure.cluster.x-k8s.io/v1beta2\nkind: OCICluster\nmetadata:\n  name: other\n---\n\
             apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata:\n  name: edge\n  namespace: fleet\n"
                .to_string(),
        );
        assert_eq!(
            ClusterIdentity::for_config(&config).unwrap(),
            ClusterIdentity {
                name: "edge".to_string(),
                namespace: "fleet".to_string()
            }
        );

        config.cluster_definition_inline =
            Some("apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata:\n  name: edge\n".to_string());
        assert_eq!(ClusterIdentity::for_config(&config).unwrap().namespace, "ocne");
    }

    #[test]
    fn built_in_resources_are_named_after_the_config() {
        let mut config = config();
        config.providers.oci.namespace = "ocne".to_string();
        let identity = ClusterIdentity::for_config(&config).unwrap();
        assert_eq!(identity.name, "demo");
        assert_eq!(identity.namespace, "ocne");

        let rendered = cluster_definition(&config, &images()).unwrap();
        assert_eq!(ClusterIdentity::from_definition(&rendered, "unused").unwrap(), identity);
    }

    #[test]
    fn definition_without_a_cluster_is_invalid() {
        let err = ClusterIdentity::from_definition(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n",
            "ocne",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn missing_image_for_shape_is_not_found() {
        let only_amd = BTreeMap::from([("amd64".to_string(), "img-amd".to_string())]);
        let err = cluster_definition(&config(), &only_amd).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn architectures_follow_shapes() {
        assert_eq!(required_architectures(&config()), vec!["amd64", "arm64"]);
        assert_eq!(
            required_architectures(&ClusterConfig::default()),
            vec!["amd64"]
        );
    }
}
