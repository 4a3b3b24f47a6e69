//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, dynamic resource plumbing, and the endpoint and
//! health probes every driver runs against a freshly provisioned cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, info, trace};

use crate::retry::{poll, poll_until, Poll, RetryStrategy};
use crate::{Error, Result, KUBE_SYSTEM_NAMESPACE, LABEL_CLUSTER_NAME, LABEL_CONTROL_PLANE};

/// Interval between node and endpoint probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long to wait for the node list to become non-empty
pub const NODE_LIST_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// How long to wait for a node to report Ready
pub const NODE_READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// How long to wait for a workload cluster's kubeconfig secret
pub const KUBECONFIG_SECRET_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// ConfigMap holding kubeadm's ClusterConfiguration
pub const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
/// Key of the ClusterConfiguration document in [`KUBEADM_CONFIG_MAP`]
pub const KUBEADM_CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";
/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "ocne";

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::validation(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::validation(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::validation(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| Error::fatal(format!("failed to create client: {}", e)))
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{lower}s")
        } else {
            format!("{stem}ies")
        }
    } else {
        format!("{lower}s")
    }
}

/// Fetch a dynamic object, mapping 404 to `None`
pub async fn get_dynamic(
    client: &Client,
    ar: &ApiResource,
    namespace: &str,
    name: &str,
) -> Result<Option<DynamicObject>> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, ar);
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// True if the node reports `Ready=True`
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// True if the node carries the control-plane role label
pub fn node_is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(LABEL_CONTROL_PLANE))
}

/// The kubelet version the node reports
pub fn node_kubelet_version(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.kubelet_version.as_str())
}

/// True if the API server answers a version request
pub async fn api_server_responds(client: &Client) -> bool {
    match client.apiserver_version().await {
        Ok(info) => {
            trace!(version = %info.git_version, "API server responded");
            true
        }
        Err(e) => {
            trace!(error = %e, "API server not responding");
            false
        }
    }
}

/// Wait until the API server answers
pub async fn wait_for_api_server(client: &Client, timeout: Duration) -> Result<()> {
    poll_until(timeout, DEFAULT_POLL_INTERVAL, "the API server", || async {
        Ok(api_server_responds(client).await)
    })
    .await
}

/// Poll the node list until it is non-empty
///
/// Succeeds with the first non-empty list. List errors are retried until the
/// ten minute budget runs out.
pub async fn wait_until_get_nodes_succeeds(client: &Client) -> Result<Vec<Node>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let strategy = RetryStrategy::linear(DEFAULT_POLL_INTERVAL, NODE_LIST_TIMEOUT);
    poll(&strategy, "nodes to be listed", || async {
        let list = nodes.list(&ListParams::default()).await?;
        if list.items.is_empty() {
            Ok(Poll::Pending)
        } else {
            Ok(Poll::Ready(list.items))
        }
    })
    .await
}

/// Poll a node until its Ready condition is True
pub async fn wait_until_node_is_ready(client: &Client, node_name: &str) -> Result<()> {
    wait_until_node_is_ready_with_timeout(client, node_name, NODE_READY_TIMEOUT).await
}

/// [`wait_until_node_is_ready`] with a caller-chosen timeout
pub async fn wait_until_node_is_ready_with_timeout(
    client: &Client,
    node_name: &str,
    timeout: Duration,
) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    poll_until(
        timeout,
        DEFAULT_POLL_INTERVAL,
        &format!("node {node_name} to be ready"),
        || async {
            let node = nodes.get_opt(node_name).await?;
            Ok(node.as_ref().is_some_and(node_is_ready))
        },
    )
    .await?;
    info!(node = %node_name, "Node is ready");
    Ok(())
}

/// Read kubeadm's ClusterConfiguration document from `kube-system/kubeadm-config`
pub async fn kubeadm_cluster_configuration(client: &Client) -> Result<serde_yaml::Value> {
    let cms: Api<ConfigMap> = Api::namespaced(client.clone(), KUBE_SYSTEM_NAMESPACE);
    let cm = cms
        .get(KUBEADM_CONFIG_MAP)
        .await
        .map_err(|e| Error::from(e).with_context("reading kubeadm-config"))?;
    let doc = cm
        .data
        .as_ref()
        .and_then(|d| d.get(KUBEADM_CLUSTER_CONFIGURATION_KEY))
        .ok_or_else(|| {
            Error::validation_for_field(
                "data.ClusterConfiguration",
                "kubeadm-config has no ClusterConfiguration",
            )
        })?;
    Ok(serde_yaml::from_str(doc)?)
}

/// The `kubernetesVersion` recorded in kubeadm's ClusterConfiguration
pub async fn kubeadm_kubernetes_version(client: &Client) -> Result<String> {
    let cfg = kubeadm_cluster_configuration(client).await?;
    cfg.get("kubernetesVersion")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation_for_field(
                "ClusterConfiguration.kubernetesVersion",
                "kubeadm-config has no kubernetesVersion",
            )
        })
}

/// `controlPlaneEndpoint` from a ClusterConfiguration document, if set
pub fn control_plane_endpoint_from_kubeadm(cfg: &serde_yaml::Value) -> Option<String> {
    cfg.get("controlPlaneEndpoint")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The API server URL of the current context in a kubeconfig
pub fn kubeconfig_server(path: &Path) -> Result<String> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::validation(format!("failed to read kubeconfig {}: {}", path.display(), e))
    })?;
    server_from_kubeconfig(&kubeconfig)
}

/// The API server URL of the current context
pub fn server_from_kubeconfig(kubeconfig: &Kubeconfig) -> Result<String> {
    let cluster_name = match &kubeconfig.current_context {
        Some(ctx) => kubeconfig
            .contexts
            .iter()
            .find(|c| &c.name == ctx)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone()),
        None => None,
    };
    let cluster = match cluster_name {
        Some(name) => kubeconfig.clusters.iter().find(|c| c.name == name),
        None => kubeconfig.clusters.first(),
    };
    cluster
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
        .ok_or_else(|| Error::validation_for_field("clusters[].cluster.server", "kubeconfig has no server"))
}

/// `host:port` from an API server URL, defaulting the port by scheme
pub fn endpoint_from_server_url(server: &str) -> Result<String> {
    let parsed = url::Url::parse(server)
        .map_err(|e| Error::validation(format!("invalid server URL {server:?}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::validation(format!("server URL {server:?} has no host")))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| Error::validation(format!("server URL {server:?} has no port")))?;
    Ok(format!("{host}:{port}"))
}

/// Live control plane endpoint as `host:port`
///
/// Prefers the kubeadm `controlPlaneEndpoint`; falls back to the host of the
/// kubeconfig's server URL when kubeadm state is unreadable or empty.
pub async fn get_control_plane_endpoint(client: &Client, kubeconfig: &Path) -> Result<String> {
    match kubeadm_cluster_configuration(client).await {
        Ok(cfg) => {
            if let Some(ep) = control_plane_endpoint_from_kubeadm(&cfg) {
                return Ok(ep);
            }
            debug!("kubeadm-config has no controlPlaneEndpoint, using kubeconfig server");
        }
        Err(e) => debug!(error = %e, "could not read kubeadm-config, using kubeconfig server"),
    }
    endpoint_from_server_url(&kubeconfig_server(kubeconfig)?)
}

/// One resource from a multi-document YAML stream
#[derive(Clone, Debug)]
pub struct Manifest {
    /// Resource type
    pub api_resource: ApiResource,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, if set
    pub namespace: Option<String>,
    /// The full object as JSON
    pub value: serde_json::Value,
}

/// Split a multi-document YAML stream into manifests, skipping empty documents
pub fn parse_manifests(yaml: &str) -> Result<Vec<Manifest>> {
    use serde::Deserialize;

    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let value: serde_json::Value = serde_json::to_value(value)?;
        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation_for_field("apiVersion", "manifest has no apiVersion"))?;
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation_for_field("kind", "manifest has no kind"))?;
        let metadata = value.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::validation_for_field("metadata.name", format!("{kind} has no name"))
            })?
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        out.push(Manifest {
            api_resource: build_api_resource(api_version, kind),
            name,
            namespace,
            value,
        });
    }
    Ok(out)
}

/// Server-side apply every document in a YAML stream
///
/// Namespaced documents without a namespace land in `default_namespace`.
pub async fn apply_manifests(client: &Client, yaml: &str, default_namespace: &str) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for manifest in parse_manifests(yaml)? {
        let ns = manifest
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string());
        let api: Api<DynamicObject> =
            if manifest.api_resource.kind == "Namespace" {
                Api::all_with(client.clone(), &manifest.api_resource)
            } else {
                Api::namespaced_with(client.clone(), &ns, &manifest.api_resource)
            };
        api.patch(&manifest.name, &params, &Patch::Apply(&manifest.value))
            .await
            .map_err(|e| {
                Error::from(e).with_context(&format!(
                    "applying {} {}",
                    manifest.api_resource.kind, manifest.name
                ))
            })?;
        debug!(kind = %manifest.api_resource.kind, name = %manifest.name, "Applied manifest");
    }
    Ok(())
}

/// Find the kubeconfig secret for `cluster` among a namespace's secrets
pub fn find_kubeconfig_secret<'a>(secrets: &'a [Secret], cluster: &str) -> Option<&'a Secret> {
    secrets.iter().find(|s| {
        let labelled = s
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_CLUSTER_NAME))
            .is_some_and(|v| v == cluster);
        let named = s
            .metadata
            .name
            .as_deref()
            .is_some_and(|n| n.contains("kubeconfig"));
        labelled && named
    })
}

/// Wait for the workload cluster kubeconfig secret and return its contents
pub async fn wait_for_kubeconfig_secret(
    client: &Client,
    namespace: &str,
    cluster: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{LABEL_CLUSTER_NAME}={cluster}");
    let strategy = RetryStrategy::linear(DEFAULT_POLL_INTERVAL, timeout);
    poll(
        &strategy,
        &format!("kubeconfig secret for cluster {cluster}"),
        || async {
            let list = secrets.list(&ListParams::default().labels(&selector)).await?;
            let Some(secret) = find_kubeconfig_secret(&list.items, cluster) else {
                return Ok(Poll::Pending);
            };
            match secret.data.as_ref().and_then(|d| d.get("value")) {
                Some(v) => Ok(Poll::Ready(v.0.clone())),
                None => Ok(Poll::Pending),
            }
        },
    )
    .await
}

/// Write a kubeconfig to memory-backed storage and return its path
///
/// Uses `/dev/shm` when present so credentials never touch disk; falls back
/// to the temp directory.
pub fn write_memory_kubeconfig(cluster: &str, contents: &[u8]) -> Result<PathBuf> {
    let shm = Path::new("/dev/shm");
    let dir = if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    write_kubeconfig_in(&dir, cluster, contents)
}

/// Write a kubeconfig under `dir` with a unique, owner-only file
pub fn write_kubeconfig_in(dir: &Path, cluster: &str, contents: &[u8]) -> Result<PathBuf> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix(&format!("kubeconfig.{cluster}."))
        .tempfile_in(dir)?;
    file.write_all(contents)?;
    let (_, path) = file
        .keep()
        .map_err(|e| Error::fatal(format!("failed to persist kubeconfig: {}", e)))?;
    Ok(path)
}
