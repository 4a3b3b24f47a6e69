//! Common types for ocne: configuration, errors, retry and Kubernetes helpers

#![deny(missing_docs)]

pub mod command;
pub mod config;
pub mod error;
pub mod image;
pub mod kube_utils;
pub mod paths;
pub mod retry;
pub mod script;
pub mod version;
pub mod waiter;

pub use config::{ClusterConfig, ProviderKind};
pub use error::{Error, ErrorContext};
pub use version::KubeVersion;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation asking the control plane provider not to install kube-proxy
pub const ANNOTATION_SKIP_KUBE_PROXY: &str = "controlplane.cluster.x-k8s.io/skip-kube-proxy";

/// Annotation asking the control plane provider not to install CoreDNS
pub const ANNOTATION_SKIP_COREDNS: &str = "controlplane.cluster.x-k8s.io/skip-coredns";

/// Node annotation set by the node OS when a staged update is ready to apply
pub const ANNOTATION_UPDATE_AVAILABLE: &str = "ocne.oracle.com/update-available";

/// Label carrying the owning cluster name on cluster-management resources
pub const LABEL_CLUSTER_NAME: &str = "cluster.x-k8s.io/cluster-name";

/// Label identifying control plane nodes
pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

/// Force node images to be rebuilt during Stage
pub const ENV_STAGE_FORCE_UPLOAD: &str = "OCNE_OCI_STAGE_FORCE_UPLOAD";

/// Force machine templates to be regenerated during Stage
pub const ENV_STAGE_FORCE_TEMPLATES: &str = "OCNE_OCI_STAGE_FORCE_TEMPLATES";

/// Path to a YAML document layered under every cluster configuration
pub const ENV_DEFAULTS: &str = "OCNE_DEFAULTS";

/// Free-form tag holding the kubernetes version of a platform image
pub const TAG_KUBERNETES: &str = "ocne/kubernetes";

/// Free-form tag holding the architecture of a platform image
pub const TAG_ARCHITECTURE: &str = "ocne/architecture";

/// Namespace holding kubeadm state and bootstrap tokens
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Namespace for ocne helper pods
pub const OCNE_SYSTEM_NAMESPACE: &str = "ocne-system";

/// True if an environment flag is set to a non-empty value
pub fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| !v.is_empty())
}
