//! Cluster operations used while rolling nodes
//!
//! [`NodeOps`] is everything the update engine asks of a cluster. The kube
//! implementation cordons through a merge patch on `spec.unschedulable` and
//! drains by evicting every pod a controller will reschedule, retrying while
//! a disruption budget refuses the eviction.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use ocne_common::kube_utils::{self, KUBEADM_CLUSTER_CONFIGURATION_KEY, KUBEADM_CONFIG_MAP};
use ocne_common::script::{self, NodeScript, ScriptOutput};
use ocne_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};

/// Default time allowed for a drain
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// How a node is drained
#[derive(Clone, Debug)]
pub struct DrainOptions {
    /// Wall-clock limit for evicting and waiting out every pod
    pub timeout: Duration,
    /// Delete pods directly instead of going through the eviction API
    pub disable_eviction: bool,
    /// Evict pods even if they use emptyDir volumes
    pub delete_emptydir_data: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DRAIN_TIMEOUT,
            disable_eviction: false,
            delete_emptydir_data: false,
        }
    }
}

/// Why a drain stopped
#[derive(Debug, Error)]
pub enum DrainError {
    /// Marking the node unschedulable failed
    #[error("failed to cordon node {node}: {message}")]
    Cordon {
        /// Node being drained
        node: String,
        /// API error
        message: String,
    },

    /// The pods on the node could not be listed
    #[error("failed to list pods on node {node}: {message}")]
    ListPods {
        /// Node being drained
        node: String,
        /// API error
        message: String,
    },

    /// Pods would lose emptyDir data and that was not allowed
    #[error("node {node} has pods with local storage: {}", .pods.join(", "))]
    LocalStorage {
        /// Node being drained
        node: String,
        /// `namespace/name` of each blocking pod
        pods: Vec<String>,
    },

    /// The API refused to evict a pod
    #[error("failed to evict {pod} from node {node}: {message}")]
    Eviction {
        /// Node being drained
        node: String,
        /// `namespace/name`
        pod: String,
        /// API error
        message: String,
    },

    /// Pods were still present when the drain timeout ran out
    #[error("timed out after {seconds}s draining node {node}, remaining: {}", .remaining.join(", "))]
    Timeout {
        /// Node being drained
        node: String,
        /// Drain timeout in seconds
        seconds: u64,
        /// `namespace/name` of pods still on the node
        remaining: Vec<String>,
    },
}

impl DrainError {
    /// Node the drain was for
    pub fn node(&self) -> &str {
        match self {
            DrainError::Cordon { node, .. }
            | DrainError::ListPods { node, .. }
            | DrainError::LocalStorage { node, .. }
            | DrainError::Eviction { node, .. }
            | DrainError::Timeout { node, .. } => node,
        }
    }
}

impl From<DrainError> for Error {
    fn from(e: DrainError) -> Self {
        match e {
            DrainError::Timeout { ref node, seconds, .. } => Error::Timeout {
                operation: format!("draining node {node} ({e})"),
                seconds,
            },
            DrainError::LocalStorage { ref node, .. } => Error::precondition(node.clone(), e.to_string()),
            other => Error::fatal(other.to_string()),
        }
    }
}

/// A pod the drain has to remove
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionTarget {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl std::fmt::Display for EvictionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What a finished drain removed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Node that was drained
    pub node: String,
    /// Pods that were evicted or deleted
    pub evicted: Vec<EvictionTarget>,
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
}

fn uses_emptydir(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|vols| vols.iter().any(|v| v.empty_dir.is_some()))
}

/// Pods on `node` that a drain must remove
///
/// Mirror pods and DaemonSet pods stay. Pods with emptyDir volumes fail the
/// drain unless `delete_emptydir_data` is set.
pub fn eviction_targets(
    node: &str,
    pods: &[Pod],
    opts: &DrainOptions,
) -> std::result::Result<Vec<EvictionTarget>, DrainError> {
    let mut targets = Vec::new();
    let mut blocked = Vec::new();
    for pod in pods {
        if is_mirror_pod(pod) || is_daemonset_pod(pod) {
            continue;
        }
        let target = EvictionTarget {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        };
        if uses_emptydir(pod) && !opts.delete_emptydir_data {
            blocked.push(target.to_string());
            continue;
        }
        targets.push(target);
    }
    if !blocked.is_empty() {
        return Err(DrainError::LocalStorage {
            node: node.to_string(),
            pods: blocked,
        });
    }
    Ok(targets)
}

/// Operations the update engine performs against a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeOps: Send + Sync {
    /// Every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Mark a node unschedulable
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Mark a node schedulable again
    async fn uncordon(&self, node: &str) -> Result<()>;

    /// Evict every pod a controller will reschedule and wait for them to go
    async fn drain(&self, node: &str, opts: &DrainOptions) -> std::result::Result<DrainReport, DrainError>;

    /// kubeadm's ClusterConfiguration document
    async fn kubeadm_cluster_configuration(&self) -> Result<serde_yaml::Value>;

    /// Replace kubeadm's ClusterConfiguration document
    async fn update_kubeadm_cluster_configuration(&self, config: &serde_yaml::Value) -> Result<()>;

    /// A ConfigMap, if it exists
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a namespace if it is missing
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Run a privileged script pod on a node
    async fn run_script(&self, script: &NodeScript) -> Result<ScriptOutput>;

    /// Delete a pod; absent pods are fine
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Wait for the API server to answer
    async fn wait_for_api_server(&self, timeout: Duration) -> Result<()>;

    /// Wait for a node's Ready condition to be True
    async fn wait_for_node_ready(&self, node: &str, timeout: Duration) -> Result<()>;
}

/// [`NodeOps`] over a kube client
#[derive(Clone)]
pub struct KubeNodeOps {
    client: Client,
    kubeconfig: Option<PathBuf>,
}

impl KubeNodeOps {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kubeconfig: None,
        }
    }

    /// Connect with a kubeconfig, or the ambient configuration if `None`
    pub async fn connect(kubeconfig: Option<PathBuf>) -> Result<Self> {
        let client = kube_utils::create_client(kubeconfig.as_deref()).await?;
        Ok(Self { client, kubeconfig })
    }

    /// Kubeconfig the client was built from
    pub fn kubeconfig(&self) -> Option<&std::path::Path> {
        self.kubeconfig.as_deref()
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from(e).with_context(&format!("patching node {node}")))?;
        Ok(())
    }

    async fn remove_pod(
        &self,
        node: &str,
        target: &EvictionTarget,
        opts: &DrainOptions,
        deadline: Instant,
    ) -> std::result::Result<(), DrainError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        loop {
            let res = if opts.disable_eviction {
                pods.delete(&target.name, &DeleteParams::default()).await.map(|_| ())
            } else {
                pods.evict(&target.name, &EvictParams::default()).await.map(|_| ())
            };
            match res {
                Ok(()) => {
                    debug!(node, pod = %target, "Evicted pod");
                    return Ok(());
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 429 => {
                    if Instant::now() >= deadline {
                        return Err(DrainError::Timeout {
                            node: node.to_string(),
                            seconds: opts.timeout.as_secs(),
                            remaining: vec![target.to_string()],
                        });
                    }
                    debug!(node, pod = %target, "Disruption budget blocks eviction, retrying");
                    tokio::time::sleep(EVICTION_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(DrainError::Eviction {
                        node: node.to_string(),
                        pod: target.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn pods_on_node(&self, node: &str) -> std::result::Result<Vec<Pod>, DrainError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={node}"));
        pods.list(&lp)
            .await
            .map(|l| l.items)
            .map_err(|e| DrainError::ListPods {
                node: node.to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl NodeOps for KubeNodeOps {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    async fn cordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, true).await?;
        info!(node, "Cordoned node");
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, false).await?;
        info!(node, "Uncordoned node");
        Ok(())
    }

    async fn drain(&self, node: &str, opts: &DrainOptions) -> std::result::Result<DrainReport, DrainError> {
        let deadline = Instant::now() + opts.timeout;
        let targets = eviction_targets(node, &self.pods_on_node(node).await?, opts)?;
        info!(node, pods = targets.len(), "Draining node");

        for target in &targets {
            self.remove_pod(node, target, opts, deadline).await?;
        }

        loop {
            let present = self.pods_on_node(node).await?;
            let remaining: Vec<String> = targets
                .iter()
                .filter(|t| {
                    present.iter().any(|p| {
                        p.metadata.namespace.as_deref() == Some(t.namespace.as_str())
                            && p.metadata.name.as_deref() == Some(t.name.as_str())
                    })
                })
                .map(ToString::to_string)
                .collect();
            if remaining.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DrainError::Timeout {
                    node: node.to_string(),
                    seconds: opts.timeout.as_secs(),
                    remaining,
                });
            }
            debug!(node, remaining = remaining.len(), "Waiting for evicted pods to terminate");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        Ok(DrainReport {
            node: node.to_string(),
            evicted: targets,
        })
    }

    async fn kubeadm_cluster_configuration(&self) -> Result<serde_yaml::Value> {
        kube_utils::kubeadm_cluster_configuration(&self.client).await
    }

    async fn update_kubeadm_cluster_configuration(&self, config: &serde_yaml::Value) -> Result<()> {
        let cms: Api<ConfigMap> = Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let doc = serde_yaml::to_string(config)?;
        let patch = json!({ "data": { KUBEADM_CLUSTER_CONFIGURATION_KEY: doc } });
        cms.patch(KUBEADM_CONFIG_MAP, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from(e).with_context("updating kubeadm-config"))?;
        Ok(())
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let cms: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(cms.get_opt(name).await?)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        if namespaces.get_opt(name).await?.is_some() {
            return Ok(());
        }
        let ns = Namespace {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::from(e).with_context(&format!("creating namespace {name}"))),
        }
    }

    async fn run_script(&self, script: &NodeScript) -> Result<ScriptOutput> {
        script::run_node_script(&self.client, script).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        script::delete_pod(&self.client, namespace, name).await
    }

    async fn wait_for_api_server(&self, timeout: Duration) -> Result<()> {
        kube_utils::wait_for_api_server(&self.client, timeout).await
    }

    async fn wait_for_node_ready(&self, node: &str, timeout: Duration) -> Result<()> {
        kube_utils::wait_until_node_is_ready_with_timeout(&self.client, node, timeout).await
    }
}
