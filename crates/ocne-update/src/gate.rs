//! Preconditions for updating a node

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::Node;

use ocne_common::kube_utils::{node_is_control_plane, node_kubelet_version};
use ocne_common::{Error, KubeVersion, Result, ANNOTATION_UPDATE_AVAILABLE};

/// True if the node OS has staged an update
pub fn update_available(node: &Node) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_UPDATE_AVAILABLE))
        .is_some_and(|v| v == "true")
}

fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

fn kubelet_version(node: &Node) -> Result<Option<KubeVersion>> {
    node_kubelet_version(node).map(KubeVersion::parse).transpose()
}

/// Fail unless the node carries the update-available annotation
pub fn require_update_available(node: &Node) -> Result<()> {
    if update_available(node) {
        Ok(())
    } else {
        Err(Error::precondition(node_name(node), "no updates available"))
    }
}

/// Refuse to move a worker to a new minor before the control plane is there
///
/// `desired` is the control plane's kubernetes version from kubeadm. A worker
/// already on that minor only takes a patch update and always passes. Otherwise
/// every control plane node must have applied its own update and report a
/// kubelet at or beyond the desired minor.
pub fn check_worker_gate(worker: &Node, nodes: &[Node], desired: &str) -> Result<()> {
    let name = node_name(worker);
    let target = KubeVersion::parse(desired)?;
    if kubelet_version(worker)?.is_some_and(|v| v.same_minor(&target)) {
        return Ok(());
    }

    for cp in nodes.iter().filter(|n| node_is_control_plane(n)) {
        let cp_name = node_name(cp);
        if update_available(cp) {
            return Err(Error::precondition(
                name,
                format!("control plane node {cp_name} has an update pending; update it first"),
            ));
        }
        let lagging = kubelet_version(cp)?.is_none_or(|v| v.cmp_minor(&target) == Ordering::Less);
        if lagging {
            return Err(Error::precondition(
                name,
                format!("control plane node {cp_name} is not yet running kubernetes {}", target.minor_string()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, NodeSystemInfo};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use ocne_common::{ANNOTATION_UPDATE_AVAILABLE, LABEL_CONTROL_PLANE};

    pub fn node(name: &str, kubelet: &str, control_plane: bool, update: bool) -> Node {
        let mut labels = BTreeMap::new();
        if control_plane {
            labels.insert(LABEL_CONTROL_PLANE.to_string(), String::new());
        }
        let mut annotations = BTreeMap::new();
        if update {
            annotations.insert(ANNOTATION_UPDATE_AVAILABLE.to_string(), "true".to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    kubelet_version: kubelet.to_string(),
                    ..Default::default()
                }),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::node;
    use super::*;

    #[test]
    fn worker_waits_for_pending_control_plane() {
        let w1 = node("w1", "v1.29.4", false, true);
        let cp1 = node("cp1", "v1.30.0", true, true);
        let nodes = vec![cp1, w1.clone()];

        let err = check_worker_gate(&w1, &nodes, "v1.30.0").unwrap_err();
        assert!(matches!(err, Error::Precondition { ref subject, .. } if subject == "w1"));
        assert!(err.to_string().contains("cp1"));
    }

    #[test]
    fn worker_waits_for_lagging_control_plane() {
        let w1 = node("w1", "v1.29.4", false, true);
        let nodes = vec![node("cp1", "v1.29.8", true, false), w1.clone()];

        let err = check_worker_gate(&w1, &nodes, "v1.30.2").unwrap_err();
        assert!(err.to_string().contains("1.30"));
    }

    #[test]
    fn worker_follows_an_updated_control_plane() {
        let w1 = node("w1", "v1.29.4", false, true);
        let nodes = vec![node("cp1", "v1.30.2", true, false), w1.clone()];
        check_worker_gate(&w1, &nodes, "v1.30.2").unwrap();
    }

    #[test]
    fn patch_updates_skip_the_gate() {
        let w1 = node("w1", "v1.30.1", false, true);
        let nodes = vec![node("cp1", "v1.30.1", true, true), w1.clone()];
        check_worker_gate(&w1, &nodes, "v1.30.1").unwrap();
    }

    #[test]
    fn nodes_without_annotation_have_nothing_to_apply() {
        let err = require_update_available(&node("w1", "v1.30.1", false, false)).unwrap_err();
        assert!(err.to_string().contains("no updates available"));
        require_update_available(&node("w1", "v1.30.1", false, true)).unwrap();
    }
}
