//! Pre-update preparation
//!
//! Clusters created before kubernetes 1.31 pin kube-proxy, CoreDNS, the CNI
//! and the UI to version-specific image tags. Updated node images refer to
//! them as `current`, so every node gets its local images retagged first and
//! kube-proxy and CoreDNS become managed applications. Each step is
//! idempotent and may be run on its own.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use ocne_common::kube_utils::node_kubelet_version;
use ocne_common::script::NodeScript;
use ocne_common::waiter::{wait_for_all, Waiter};
use ocne_common::{Error, KubeVersion, Result, OCNE_SYSTEM_NAMESPACE};

use crate::apps::{adopt_managed_apps, AppInstaller};
use crate::ops::NodeOps;
use crate::scripts::{pod_name, retag_repositories, RETAG_SCRIPT};

/// Newest kubelet minor whose nodes still need preparing
pub const RETAG_KUBELET_THRESHOLD: &str = "1.30";

/// Which pre-update steps to run
#[derive(Clone, Debug)]
pub struct PreUpdateOptions {
    /// Retag node images
    pub retag: bool,
    /// Adopt kube-proxy and CoreDNS as managed applications
    pub adopt_apps: bool,
    /// Render progress bars
    pub show_ui: bool,
}

impl Default for PreUpdateOptions {
    fn default() -> Self {
        Self {
            retag: true,
            adopt_apps: true,
            show_ui: false,
        }
    }
}

/// What the pre-update did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreUpdateReport {
    /// No node was at or below the threshold
    pub skipped: bool,
    /// Nodes whose images were retagged
    pub retagged: Vec<String>,
    /// Nodes where retagging failed, with the error
    pub failed: BTreeMap<String, String>,
    /// Releases installed as managed applications
    pub adopted: Vec<String>,
}

/// True if any node runs a kubelet at or below [`RETAG_KUBELET_THRESHOLD`]
pub fn needs_pre_update(nodes: &[Node]) -> Result<bool> {
    let threshold = KubeVersion::parse(RETAG_KUBELET_THRESHOLD)?;
    for node in nodes {
        let Some(version) = node_kubelet_version(node) else {
            continue;
        };
        if KubeVersion::parse(version)?.cmp_minor(&threshold).is_le() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Apply the partial-failure rule to per-node retag outcomes
///
/// Some nodes failing is tolerated. Every attempted node failing is fatal.
pub fn tally_retag(outcomes: BTreeMap<String, Result<()>>) -> Result<(Vec<String>, BTreeMap<String, String>)> {
    let attempted = outcomes.len();
    let mut succeeded = Vec::new();
    let mut failed = BTreeMap::new();
    for (node, outcome) in outcomes {
        match outcome {
            Ok(()) => succeeded.push(node),
            Err(e) => {
                failed.insert(node, e.to_string());
            }
        }
    }
    if attempted > 0 && succeeded.is_empty() {
        let detail: Vec<String> = failed.iter().map(|(n, e)| format!("{n}: {e}")).collect();
        return Err(Error::fatal(format!(
            "retagging images failed on every node ({})",
            detail.join("; ")
        )));
    }
    Ok((succeeded, failed))
}

/// The retag script for one node
pub fn retag_script(node: &str) -> NodeScript {
    NodeScript::new(node, OCNE_SYSTEM_NAMESPACE, pod_name("ocne-retag", node), RETAG_SCRIPT)
        .with_env("IMAGES", retag_repositories().join(" "))
}

async fn retag_nodes(ops: Arc<dyn NodeOps>, nodes: Vec<String>, show_ui: bool) -> Result<(Vec<String>, BTreeMap<String, String>)> {
    ops.ensure_namespace(OCNE_SYSTEM_NAMESPACE).await?;

    let outcomes: Arc<Mutex<BTreeMap<String, Result<()>>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let waiters = nodes
        .into_iter()
        .map(|node| {
            let ops = Arc::clone(&ops);
            let outcomes = Arc::clone(&outcomes);
            Waiter::new(format!("Retagging images on {node}"), move |handle| async move {
                handle.set_message("running script");
                let res = ops.run_script(&retag_script(&node)).await.map(|out| {
                    debug!(node = %node, logs = %out.logs.trim(), "Retag script finished");
                });
                let reported = match &res {
                    Ok(()) => Ok(()),
                    Err(e) => Err(Error::fatal(e.to_string())),
                };
                outcomes
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(node, res);
                reported
            })
        })
        .collect();

    if let Err(e) = wait_for_all(waiters, show_ui).await {
        warn!(error = %e, "Retagging failed on some nodes");
    }
    let outcomes = std::mem::take(&mut *outcomes.lock().unwrap_or_else(|p| p.into_inner()));
    tally_retag(outcomes)
}

/// Prepare a cluster for its first node update
pub async fn pre_update(
    ops: Arc<dyn NodeOps>,
    installer: &dyn AppInstaller,
    opts: &PreUpdateOptions,
) -> Result<PreUpdateReport> {
    let nodes = ops.list_nodes().await?;
    if !needs_pre_update(&nodes)? {
        info!("No nodes need preparing, skipping pre-update");
        return Ok(PreUpdateReport {
            skipped: true,
            ..Default::default()
        });
    }

    let mut report = PreUpdateReport::default();
    if opts.retag {
        let names = nodes.iter().filter_map(|n| n.metadata.name.clone()).collect();
        let (retagged, failed) = retag_nodes(Arc::clone(&ops), names, opts.show_ui).await?;
        info!(retagged = retagged.len(), failed = failed.len(), "Retagged node images");
        report.retagged = retagged;
        report.failed = failed;
    }
    if opts.adopt_apps {
        report.adopted = adopt_managed_apps(ops.as_ref(), installer).await?;
    }
    Ok(report)
}
