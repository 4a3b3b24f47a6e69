//! Shell scripts run on nodes through privileged pods
//!
//! Both scripts run chrooted into the host root. Inputs are passed as
//! environment variables on the pod, never spliced into the script text.

use aws_lc_rs::digest;

/// Tag the retag script gives local images
pub const CURRENT_TAG: &str = "current";

/// Registry the node images come from
pub const IMAGE_REGISTRY: &str = "container-registry.oracle.com/olcne";

/// Images retagged to [`CURRENT_TAG`] before the first update
pub const RETAGGED_IMAGES: &[&str] = &["kube-proxy", "coredns", "flannel", "ui"];

/// ostree OS name of the node image
pub const OSTREE_OS: &str = "ock";

/// Kernel argument set on the first boot only
pub const FIRST_BOOT_KARG: &str = "ignition.firstboot";

/// systemd unit that stages updates on the node
pub const UPDATE_SERVICE: &str = "ocne-update.service";

/// Seconds between scheduling the reboot and performing it
pub const REBOOT_DELAY_SECS: u32 = 3;

/// Retag every present image to `current` unless the node already has it
///
/// Reads `IMAGES`, a space separated list of repositories.
pub const RETAG_SCRIPT: &str = r#"set -e
inventory=$(podman images --format '{{.Repository}}:{{.Tag}}')
for repo in $IMAGES; do
  if echo "$inventory" | grep -qx "$repo:current"; then
    echo "$repo already tagged current"
    continue
  fi
  latest=$(echo "$inventory" | grep "^$repo:" | sort -V | tail -n 1)
  if [ -z "$latest" ]; then
    echo "$repo not present"
    continue
  fi
  podman tag "$latest" "$repo:current"
  echo "tagged $latest as $repo:current"
done
"#;

/// Deploy the staged ostree commit, clear the annotation and reboot
///
/// Reads `NODE_NAME`, `OSTREE_OS`, `OSTREE_REF`, `UPDATE_SERVICE`,
/// `FIRST_BOOT_KARG`, `ANNOTATION` and `REBOOT_DELAY`.
pub const UPDATE_SCRIPT: &str = r#"set -e
systemctl stop "$UPDATE_SERVICE" || true
ostree admin deploy --os "$OSTREE_OS" "$OSTREE_REF"
if grep -qw "$FIRST_BOOT_KARG" /proc/cmdline; then
  rpm-ostree kargs --delete-if-present="$FIRST_BOOT_KARG"
fi
kubectl --kubeconfig /etc/kubernetes/kubelet.conf annotate node "$NODE_NAME" "$ANNOTATION-"
systemd-run --on-active="$REBOOT_DELAY" systemctl reboot
"#;

/// Repositories the retag script looks for
pub fn retag_repositories() -> Vec<String> {
    RETAGGED_IMAGES
        .iter()
        .map(|image| format!("{IMAGE_REGISTRY}/{image}"))
        .collect()
}

/// Pod names are DNS labels; keep within 63 characters
///
/// Names that would be cut short end in a digest of the node name instead,
/// so nodes sharing a long prefix still get distinct pods.
pub fn pod_name(prefix: &str, node: &str) -> String {
    let name: String = format!("{prefix}-{node}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if name.len() <= MAX_POD_NAME {
        return name.trim_end_matches('-').to_string();
    }
    let digest = digest::digest(&digest::SHA256, node.as_bytes());
    let suffix = hex::encode(&digest.as_ref()[..NODE_DIGEST_BYTES]);
    let head = name[..MAX_POD_NAME - suffix.len() - 1].trim_end_matches('-');
    format!("{head}-{suffix}")
}

const MAX_POD_NAME: usize = 63;
const NODE_DIGEST_BYTES: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retag_covers_every_managed_image() {
        let repos = retag_repositories();
        assert_eq!(repos.len(), 4);
        assert!(repos.contains(&"container-registry.oracle.com/olcne/kube-proxy".to_string()));
        assert!(repos.contains(&"container-registry.oracle.com/olcne/coredns".to_string()));
        assert!(RETAG_SCRIPT.contains("podman tag \"$latest\" \"$repo:current\""));
        assert!(RETAG_SCRIPT.contains("grep -qx \"$repo:current\""));
    }

    #[test]
    fn update_script_reboots_last() {
        let reboot = UPDATE_SCRIPT.find("systemd-run").unwrap();
        for step in ["ostree admin deploy", "annotate node", "systemctl stop"] {
            assert!(UPDATE_SCRIPT.find(step).unwrap() < reboot, "{step}");
        }
    }

    #[test]
    fn pod_names_are_dns_labels() {
        assert_eq!(pod_name("ocne-update", "Worker.1"), "ocne-update-worker-1");
        let long = "n".repeat(80);
        assert_eq!(pod_name("ocne-update", &long).len(), 63);
    }

    #[test]
    fn long_node_names_sharing_a_prefix_get_distinct_pods() {
        let stem = "worker-pool-a-".repeat(5);
        let first = pod_name("ocne-update", &format!("{stem}1"));
        let second = pod_name("ocne-update", &format!("{stem}2"));
        assert_ne!(first, second);
        for name in [&first, &second] {
            assert!(name.len() <= 63, "{name}");
            assert!(name.starts_with("ocne-update-worker-pool-a-"));
            assert!(!name.contains("--"), "{name}");
        }
        assert_eq!(first, pod_name("ocne-update", &format!("{stem}1")));
    }
}
