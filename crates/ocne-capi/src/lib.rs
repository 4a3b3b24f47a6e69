//! Cluster API integration for ocne
//!
//! This crate provides:
//! - [`ClusterApi`], a mockable view of the management cluster's CAPI objects
//! - the [`ClusterGraph`] built from a Cluster and the objects it references
//! - [`StagePlanner`], which builds node images for a new kubernetes version,
//!   mints sibling machine templates and emits the patches that roll the cluster
//! - the OCI platform client, image builder and work-request coordinator it uses
//! - `clusterctl` helpers for provider installation, pivot and deletion

pub mod accessor;
pub mod api;
pub mod builder;
pub mod clusterctl;
pub mod graph;
pub mod naming;
pub mod oci;
pub mod shape;
pub mod stage;
pub mod template;
pub mod workrequest;

pub use accessor::{FieldPath, ObjectReference};
pub use api::{ClusterApi, KubeClusterApi};
pub use builder::{BuiltImage, ImageBuilder, ImageConverter, ImageProvider, PodImageConverter};
pub use graph::{build_graph, ClusterGraph, GraphKey, GraphNode, Gvk};
pub use naming::bump_name;
pub use oci::{OciCli, OciClient, PlatformImage, WorkRequest, WorkRequestStatus};
pub use stage::{do_update, StageOptions, StagePlanner, StageResult, UpdateFacts};
pub use workrequest::wait_for_work_requests;

#[cfg(test)]
pub use api::MockClusterApi;
#[cfg(test)]
pub use oci::MockOciClient;

/// API version of core Cluster API objects
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
/// API version of kubeadm control plane objects
pub const CONTROL_PLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta1";
/// API version of kubeadm bootstrap objects
pub const BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1beta1";
/// API version of OCI infrastructure objects
pub const OCI_INFRA_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta2";

/// Kind of the Cluster object
pub const KIND_CLUSTER: &str = "Cluster";
/// Kind of MachineDeployment objects
pub const KIND_MACHINE_DEPLOYMENT: &str = "MachineDeployment";
/// Kind of MachineSet objects
pub const KIND_MACHINE_SET: &str = "MachineSet";
/// Kind of Machine objects
pub const KIND_MACHINE: &str = "Machine";
