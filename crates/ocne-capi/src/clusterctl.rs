//! clusterctl provider installation, pivot and Cluster deletion
//!
//! Every command runs with a timeout and transient failures are retried.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::Client;
use thiserror::Error;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use ocne_common::command::Cmd;
use ocne_common::kube_utils::{self, build_api_resource};
use ocne_common::retry::poll_until;

use crate::{CAPI_API_VERSION, KIND_CLUSTER};

/// Timeout for one clusterctl invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long a deleted Cluster may take to disappear
pub const CLUSTER_DELETION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Controller deployments present once the providers are installed, as (namespace, name)
pub const PROVIDER_DEPLOYMENTS: &[(&str, &str)] = &[
    ("capi-system", "capi-controller-manager"),
    (
        "capi-kubeadm-bootstrap-system",
        "capi-kubeadm-bootstrap-controller-manager",
    ),
    (
        "capi-kubeadm-control-plane-system",
        "capi-kubeadm-control-plane-controller-manager",
    ),
    ("cluster-api-provider-oci-system", "capoci-controller-manager"),
];

type RetryCallback<'a> =
    Box<dyn Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'a>;

struct RetryConfig<'a> {
    /// Operation name for logging (e.g., "move", "init")
    operation: &'a str,
    /// Cluster or kubeconfig the operation targets
    context_name: &'a str,
    /// Runs between attempts
    on_retry: Option<RetryCallback<'a>>,
    retry_delay: Duration,
}

async fn with_retry<T, F, Fut>(config: RetryConfig<'_>, mut operation_fn: F) -> Result<T, ClusterctlError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last_error = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        match operation_fn(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = e;
                if attempt < MAX_ATTEMPTS {
                    warn!(
                        operation = %config.operation,
                        context = %config.context_name,
                        attempt,
                        error = %last_error,
                        "{} failed, retrying",
                        config.operation
                    );
                    if let Some(ref on_retry) = config.on_retry {
                        on_retry().await;
                    }
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    Err(ClusterctlError::RetriesExhausted {
        attempts: MAX_ATTEMPTS,
        last_error,
    })
}

/// CAPI Cluster resource definition
pub fn cluster_api_resource() -> ApiResource {
    build_api_resource(CAPI_API_VERSION, KIND_CLUSTER)
}

/// Errors from clusterctl operations
#[derive(Debug, Error)]
pub enum ClusterctlError {
    /// Command execution or API call failed
    #[error("failed: {0}")]
    ExecutionFailed(String),

    /// All retry attempts exhausted
    #[error("failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last error message
        last_error: String,
    },

    /// The Cluster did not go away in time
    #[error("cluster {cluster} still exists after {seconds}s")]
    DeletionTimeout {
        /// Cluster name
        cluster: String,
        /// Timeout in seconds
        seconds: u64,
    },
}

impl From<ClusterctlError> for ocne_common::Error {
    fn from(e: ClusterctlError) -> Self {
        match e {
            ClusterctlError::DeletionTimeout { cluster, seconds } => ocne_common::Error::Timeout {
                operation: format!("deletion of cluster {cluster}"),
                seconds,
            },
            other => ocne_common::Error::command("clusterctl", other.to_string()),
        }
    }
}

async fn run_clusterctl(args: &[&str], kubeconfig: &Path) -> Result<(), String> {
    let cmd = Cmd::new("clusterctl")
        .args(args)
        .arg("--kubeconfig")
        .arg(kubeconfig)
        .timeout(COMMAND_TIMEOUT);
    info!(command = %cmd.description(), "Running clusterctl");
    cmd.output().await.map(|_| ()).map_err(|e| e.to_string())
}

/// Installs the Cluster API providers a cluster needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapiInstaller: Send + Sync {
    /// Install the providers into the cluster behind `kubeconfig` unless present
    async fn ensure(&self, kubeconfig: &Path) -> ocne_common::Result<()>;
}

/// [`CapiInstaller`] running `clusterctl init`
#[derive(Clone, Debug)]
pub struct ClusterctlInstaller {
    infrastructure: String,
}

impl Default for ClusterctlInstaller {
    fn default() -> Self {
        Self {
            infrastructure: "oci".to_string(),
        }
    }
}

impl ClusterctlInstaller {
    /// Arguments of the init invocation
    pub fn init_args(&self) -> Vec<&str> {
        vec![
            "init",
            "--core",
            "cluster-api",
            "--bootstrap",
            "kubeadm",
            "--control-plane",
            "kubeadm",
            "--infrastructure",
            self.infrastructure.as_str(),
            "--wait-providers",
        ]
    }
}

/// True if every provider controller deployment exists
pub async fn providers_installed(client: &Client) -> ocne_common::Result<bool> {
    for (namespace, name) in PROVIDER_DEPLOYMENTS {
        let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        if api.get_opt(name).await?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[async_trait]
impl CapiInstaller for ClusterctlInstaller {
    async fn ensure(&self, kubeconfig: &Path) -> ocne_common::Result<()> {
        let client = kube_utils::create_client(Some(kubeconfig)).await?;
        if providers_installed(&client).await? {
            info!("Cluster API providers already installed");
            return Ok(());
        }

        let context = kubeconfig.display().to_string();
        let config = RetryConfig {
            operation: "init",
            context_name: &context,
            on_retry: None,
            retry_delay: RETRY_DELAY,
        };
        let args = self.init_args();
        with_retry(config, |_| run_clusterctl(&args, kubeconfig)).await?;
        info!(infrastructure = %self.infrastructure, "Cluster API providers installed");
        Ok(())
    }
}

/// Move the cluster's Cluster API objects to the cluster behind `target_kubeconfig`
///
/// Source objects are deleted once the target holds them. A failed attempt
/// leaves the source paused, so it is unpaused before the next one.
pub async fn move_to_kubeconfig(
    source_kubeconfig: &Path,
    target_kubeconfig: &Path,
    namespace: &str,
    cluster_name: &str,
) -> Result<(), ClusterctlError> {
    let config = RetryConfig {
        operation: "move",
        context_name: cluster_name,
        on_retry: Some(Box::new({
            let kc = source_kubeconfig.to_path_buf();
            let ns = namespace.to_string();
            let cn = cluster_name.to_string();
            move || {
                let kc = kc.clone();
                let ns = ns.clone();
                let cn = cn.clone();
                Box::pin(async move {
                    if let Err(e) = unpause_capi_cluster(Some(&kc), &ns, &cn).await {
                        warn!(cluster = %cn, error = %e, "failed to unpause cluster before retry");
                    }
                })
            }
        })),
        retry_delay: RETRY_DELAY,
    };

    with_retry(config, |_attempt| {
        let target = target_kubeconfig.display().to_string();
        async move {
            run_clusterctl(
                &["move", "--to-kubeconfig", target.as_str(), "--namespace", namespace],
                source_kubeconfig,
            )
            .await
        }
    })
    .await?;

    info!(cluster = %cluster_name, namespace = %namespace, "Cluster API objects moved");
    Ok(())
}

/// Unpause a Cluster; a missing Cluster only logs
pub async fn unpause_capi_cluster(
    kubeconfig: Option<&Path>,
    namespace: &str,
    cluster_name: &str,
) -> Result<(), ClusterctlError> {
    let client = kube_utils::create_client(kubeconfig)
        .await
        .map_err(|e| ClusterctlError::ExecutionFailed(e.to_string()))?;
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &cluster_api_resource());
    let patch = serde_json::json!({"spec": {"paused": false}});

    match api
        .patch(cluster_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => info!(cluster = %cluster_name, "Cluster unpaused"),
        Err(e) => warn!(cluster = %cluster_name, error = %e, "unpause failed (may not exist)"),
    }

    Ok(())
}

/// Delete the Cluster object; an absent Cluster is not an error
pub async fn delete_cluster(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
) -> Result<(), ClusterctlError> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &cluster_api_resource());

    match api.delete(cluster_name, &DeleteParams::default()).await {
        Ok(_) => info!(cluster = %cluster_name, "Cluster deletion initiated"),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            info!(cluster = %cluster_name, "Cluster already deleted")
        }
        Err(e) => {
            return Err(ClusterctlError::ExecutionFailed(format!(
                "failed to delete cluster {cluster_name}: {e}"
            )))
        }
    }
    Ok(())
}

/// Wait for the Cluster object to return 404
pub async fn wait_for_cluster_deletion(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    timeout: Duration,
) -> Result<(), ClusterctlError> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &cluster_api_resource());
    let api = &api;

    poll_until(
        timeout,
        DELETION_POLL_INTERVAL,
        &format!("deletion of cluster {cluster_name}"),
        || async move {
            let gone = api.get_opt(cluster_name).await?.is_none();
            if !gone {
                info!(cluster = %cluster_name, "Waiting for cluster deletion");
            }
            Ok(gone)
        },
    )
    .await
    .map_err(|e| match e {
        ocne_common::Error::Timeout { seconds, .. } => ClusterctlError::DeletionTimeout {
            cluster: cluster_name.to_string(),
            seconds,
        },
        other => ClusterctlError::ExecutionFailed(other.to_string()),
    })?;

    info!(cluster = %cluster_name, "Cluster deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const TEST_RETRY_DELAY: Duration = Duration::from_millis(1);

    fn config(on_retry: Option<RetryCallback<'static>>) -> RetryConfig<'static> {
        RetryConfig {
            operation: "test",
            context_name: "test-context",
            on_retry,
            retry_delay: TEST_RETRY_DELAY,
        }
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_attempt() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count = attempt_count.clone();

        let result: Result<String, ClusterctlError> = with_retry(config(None), |_| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok("success".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_attempts() {
        let result: Result<(), ClusterctlError> =
            with_retry(config(None), |_| async { Err("persistent error".to_string()) }).await;

        match result.unwrap_err() {
            ClusterctlError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, MAX_ATTEMPTS);
                assert_eq!(last_error, "persistent error");
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    /// Story: a move that fails twice unpauses the source before each retry
    #[tokio::test]
    async fn story_failed_move_runs_recovery_between_attempts() {
        let retries = Arc::new(AtomicU32::new(0));
        let r = retries.clone();
        let on_retry: RetryCallback<'static> = Box::new(move || {
            let r = r.clone();
            Box::pin(async move {
                r.fetch_add(1, Ordering::SeqCst);
            })
        });

        let result: Result<&str, ClusterctlError> =
            with_retry(config(Some(on_retry)), |attempt| async move {
                if attempt < 3 {
                    Err("connection refused".to_string())
                } else {
                    Ok("moved")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "moved");
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cluster_resource_is_capi_cluster() {
        let ar = cluster_api_resource();
        assert_eq!(ar.group, "cluster.x-k8s.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.plural, "clusters");
    }

    #[test]
    fn init_installs_kubeadm_and_oci_providers() {
        let installer = ClusterctlInstaller::default();
        let args = installer.init_args();
        let joined = args.join(" ");
        assert!(joined.contains("--bootstrap kubeadm"));
        assert!(joined.contains("--control-plane kubeadm"));
        assert!(joined.contains("--infrastructure oci"));
    }

    #[test]
    fn deletion_timeout_maps_to_timeout_error() {
        let err: ocne_common::Error = ClusterctlError::DeletionTimeout {
            cluster: "demo".to_string(),
            seconds: 1200,
        }
        .into();
        assert!(matches!(err, ocne_common::Error::Timeout { seconds: 1200, .. }));
        assert!(err.to_string().contains("demo"));
    }
}
