//! Re-upload control plane certificates ahead of a control plane join

use std::path::Path;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use tracing::info;

use ocne_common::kube_utils::{create_client, node_is_ready};
use ocne_common::script::{run_node_script, NodeScript};
use ocne_common::{Error, LABEL_CONTROL_PLANE};

use crate::PkiError;

/// A fresh 32-byte certificate key, hex encoded, as `kubeadm certs certificate-key` prints
pub fn generate_certificate_key() -> crate::Result<String> {
    let mut raw = [0u8; 32];
    aws_lc_rs::rand::fill(&mut raw).map_err(|_| PkiError::Random)?;
    Ok(hex::encode(raw))
}

/// Script that runs the upload-certs phase with a known key
pub fn upload_certs_script(certificate_key: &str) -> String {
    format!(
        "kubeadm init phase upload-certs --upload-certs --certificate-key {certificate_key} \
         --kubeconfig /etc/kubernetes/admin.conf"
    )
}

/// Upload control plane certificates encrypted with `certificate_key`
///
/// Runs `kubeadm init phase upload-certs` in a privileged pod on a ready
/// control plane node. Joining control plane nodes decrypt the certificates
/// with the same key.
pub async fn upload_certificates(kubeconfig: &Path, certificate_key: &str) -> ocne_common::Result<()> {
    let client = create_client(Some(kubeconfig)).await?;
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default().labels(LABEL_CONTROL_PLANE))
        .await?;
    let node = list
        .items
        .iter()
        .find(|n| node_is_ready(n))
        .and_then(|n| n.metadata.name.clone())
        .ok_or_else(|| {
            Error::precondition("control plane", "no ready control plane node to upload certificates from")
        })?;

    let script = NodeScript::new(
        node.clone(),
        ocne_common::KUBE_SYSTEM_NAMESPACE,
        format!("ocne-upload-certs-{}", truncate_name(&node)),
        upload_certs_script(certificate_key),
    );
    run_node_script(&client, &script).await?;
    info!(node = %node, "Uploaded control plane certificates");
    Ok(())
}

fn truncate_name(name: &str) -> &str {
    let max = 40;
    match name.char_indices().nth(max) {
        Some((idx, _)) => name[..idx].trim_end_matches('-'),
        None => name,
    }
}
