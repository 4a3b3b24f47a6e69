//! Rolling a node onto its staged update
//!
//! One node at a time: check the node has an update and may take it, cordon
//! and drain it, run the update script (which reboots the node), wait for the
//! API server and the node to come back, uncordon, and remove the script pod.
//! A failed drain leaves the node cordoned for the operator to inspect.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use serde_yaml::Value;
use tracing::{debug, info};

use ocne_common::kube_utils::{node_is_control_plane, NODE_READY_TIMEOUT};
use ocne_common::script::NodeScript;
use ocne_common::{Error, Result, ANNOTATION_UPDATE_AVAILABLE, OCNE_SYSTEM_NAMESPACE};

use crate::gate::{check_worker_gate, require_update_available};
use crate::ops::{DrainError, DrainOptions, NodeOps};
use crate::scripts::{
    pod_name, CURRENT_TAG, FIRST_BOOT_KARG, OSTREE_OS, REBOOT_DELAY_SECS, UPDATE_SCRIPT, UPDATE_SERVICE,
};

/// Pause after the script before probing the API server
pub const REBOOT_SETTLE: Duration = Duration::from_secs(5);

/// Time allowed for the API server to come back after a reboot
pub const API_SERVER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// ostree ref the node's update service stages
pub const DEFAULT_OSTREE_REF: &str = "ock:ock";

/// How a node update runs
#[derive(Clone, Debug)]
pub struct UpdateOptions {
    /// Drain behaviour
    pub drain: DrainOptions,
    /// ostree ref deployed by the update script
    pub ostree_ref: String,
    /// Pause between the script finishing and the first API probe
    pub reboot_settle: Duration,
    /// Time allowed for the node to report Ready after the reboot
    pub node_ready_timeout: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            drain: DrainOptions::default(),
            ostree_ref: DEFAULT_OSTREE_REF.to_string(),
            reboot_settle: REBOOT_SETTLE,
            node_ready_timeout: NODE_READY_TIMEOUT,
        }
    }
}

/// The update script for one node
pub fn update_script(node: &str, opts: &UpdateOptions) -> NodeScript {
    NodeScript::new(node, OCNE_SYSTEM_NAMESPACE, pod_name("ocne-update", node), UPDATE_SCRIPT)
        .with_env("NODE_NAME", node)
        .with_env("OSTREE_OS", OSTREE_OS)
        .with_env("OSTREE_REF", opts.ostree_ref.as_str())
        .with_env("UPDATE_SERVICE", UPDATE_SERVICE)
        .with_env("FIRST_BOOT_KARG", FIRST_BOOT_KARG)
        .with_env("ANNOTATION", ANNOTATION_UPDATE_AVAILABLE)
        .with_env("REBOOT_DELAY", REBOOT_DELAY_SECS.to_string())
        .keep_pod()
}

/// Point kubeadm's CoreDNS image at `tag`; returns false if it already was
pub fn set_coredns_image_tag(config: &mut Value, tag: &str) -> bool {
    let Some(root) = config.as_mapping_mut() else {
        return false;
    };
    let dns = root
        .entry(Value::from("dns"))
        .or_insert_with(|| Value::Mapping(Default::default()));
    let Some(dns) = dns.as_mapping_mut() else {
        return false;
    };
    if dns.get("imageTag").and_then(Value::as_str) == Some(tag) {
        return false;
    }
    dns.insert(Value::from("imageTag"), Value::from(tag));
    true
}

fn kubeadm_version(config: &Value) -> Result<String> {
    config
        .get("kubernetesVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation_for_field(
                "ClusterConfiguration.kubernetesVersion",
                "kubeadm-config has no kubernetesVersion",
            )
        })
}

fn find_node<'a>(nodes: &'a [Node], name: &str) -> Result<&'a Node> {
    nodes
        .iter()
        .find(|n| n.metadata.name.as_deref() == Some(name))
        .ok_or_else(|| Error::not_found("Node", name))
}

async fn sync_coredns_tag(ops: &dyn NodeOps) -> Result<()> {
    let mut config = ops.kubeadm_cluster_configuration().await?;
    if set_coredns_image_tag(&mut config, CURRENT_TAG) {
        ops.update_kubeadm_cluster_configuration(&config).await?;
        info!(tag = CURRENT_TAG, "Updated kubeadm CoreDNS image tag");
    }
    Ok(())
}

/// Roll one node onto its staged update
pub async fn update_node(ops: &dyn NodeOps, name: &str, opts: &UpdateOptions) -> Result<()> {
    let nodes = ops.list_nodes().await?;
    let node = find_node(&nodes, name)?;
    require_update_available(node)?;

    let control_plane = node_is_control_plane(node);
    if !control_plane {
        let desired = kubeadm_version(&ops.kubeadm_cluster_configuration().await?)?;
        check_worker_gate(node, &nodes, &desired)?;
    }

    let drain = nodes.len() > 1;
    if drain {
        ops.cordon(name).await.map_err(|e| DrainError::Cordon {
            node: name.to_string(),
            message: e.to_string(),
        })?;
        let report = ops.drain(name, &opts.drain).await?;
        info!(node = name, evicted = report.evicted.len(), "Drained node");
    } else {
        debug!(node = name, "Single node cluster, not draining");
    }

    if control_plane {
        sync_coredns_tag(ops).await?;
    }

    ops.ensure_namespace(OCNE_SYSTEM_NAMESPACE).await?;
    let script = update_script(name, opts);
    info!(node = name, "Applying update, the node will reboot");
    ops.run_script(&script).await?;

    tokio::time::sleep(opts.reboot_settle).await;
    ops.wait_for_api_server(API_SERVER_TIMEOUT).await?;
    ops.wait_for_node_ready(name, opts.node_ready_timeout).await?;

    if drain {
        ops.uncordon(name).await?;
    }
    ops.delete_pod(&script.namespace, &script.name).await?;
    info!(node = name, "Node updated");
    Ok(())
}

/// Roll nodes one after another in the order given
pub async fn update_nodes(ops: &dyn NodeOps, names: &[String], opts: &UpdateOptions) -> Result<()> {
    for name in names {
        update_node(ops, name, opts).await?;
    }
    Ok(())
}
