//! Privileged script pods
//!
//! Node-level work (retagging images, deploying an ostree ref, running kubeadm
//! phases) happens by scheduling a pod pinned to the node with the host root
//! filesystem mounted and running a shell script chrooted into it.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::retry::{poll, Poll, RetryStrategy};
use crate::{Error, Result};

/// Default image for script pods
pub const DEFAULT_SCRIPT_IMAGE: &str = "container-registry.oracle.com/olcne/ocne:latest";
/// Where the node's root filesystem is mounted in the pod
pub const HOST_ROOT: &str = "/hostroot";
/// Default time allowed for a script to finish
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const POD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A script to run on a node
#[derive(Clone, Debug)]
pub struct NodeScript {
    /// Node to pin the pod to
    pub node: String,
    /// Namespace for the pod
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Shell script, run with `sh -c` inside `chroot /hostroot`
    pub script: String,
    /// Container image providing `chroot` and `sh`
    pub image: String,
    /// Extra environment for the script
    pub env: BTreeMap<String, String>,
    /// Wall-clock limit for the pod to terminate
    pub timeout: Duration,
    /// Delete the pod once it terminates
    pub delete_after: bool,
    /// Run the script inside `chroot /hostroot`
    pub chroot: bool,
    /// ConfigMaps mounted into the container, as (name, mount path)
    pub config_maps: Vec<(String, String)>,
}

impl NodeScript {
    /// A script with default image and timeout that deletes its pod afterwards
    pub fn new(
        node: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            namespace: namespace.into(),
            name: name.into(),
            script: script.into(),
            image: DEFAULT_SCRIPT_IMAGE.to_string(),
            env: BTreeMap::new(),
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            delete_after: true,
            chroot: true,
            config_maps: Vec::new(),
        }
    }

    /// Run the script in the container's own root with the host at `/hostroot`
    pub fn without_chroot(mut self) -> Self {
        self.chroot = false;
        self
    }

    /// Use a different container image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Mount a ConfigMap into the container
    pub fn with_config_map(mut self, name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        self.config_maps.push((name.into(), mount_path.into()));
        self
    }

    /// Set an environment variable for the script
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Keep the pod after it terminates; the caller deletes it
    pub fn keep_pod(mut self) -> Self {
        self.delete_after = false;
        self
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Vec<String> {
        let mut cmd = Vec::new();
        if self.chroot {
            cmd.push("chroot".to_string());
            cmd.push(HOST_ROOT.to_string());
        }
        cmd.extend(["sh".to_string(), "-c".to_string(), self.script.clone()]);
        cmd
    }

    /// The pod that runs this script
    pub fn pod(&self) -> Pod {
        let env = self
            .env
            .iter()
            .map(|(k, v)| k8s_openapi::api::core::v1::EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        let mut mounts = vec![VolumeMount {
            name: "hostroot".to_string(),
            mount_path: HOST_ROOT.to_string(),
            ..Default::default()
        }];
        let mut volumes = vec![Volume {
            name: "hostroot".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/".to_string(),
                type_: None,
            }),
            ..Default::default()
        }];
        for (i, (cm, path)) in self.config_maps.iter().enumerate() {
            let name = format!("cm{i}");
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: path.clone(),
                ..Default::default()
            });
            volumes.push(Volume {
                name,
                config_map: Some(ConfigMapVolumeSource {
                    name: cm.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "ocne".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(self.node.clone()),
                host_pid: Some(true),
                host_network: Some(true),
                restart_policy: Some("Never".to_string()),
                tolerations: Some(vec![Toleration {
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "script".to_string(),
                    image: Some(self.image.clone()),
                    command: Some(self.command()),
                    env: (!env.is_empty()).then_some(env),
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        run_as_user: Some(0),
                        ..Default::default()
                    }),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Result of a finished script pod
#[derive(Clone, Debug)]
pub struct ScriptOutput {
    /// Node the script ran on
    pub node: String,
    /// Container logs
    pub logs: String,
}

/// Terminal phase of a pod, if it has one
fn terminal_phase(pod: &Pod) -> Option<&str> {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some(p @ ("Succeeded" | "Failed")) => Some(p),
        _ => None,
    }
}

/// Run a script on a node and return its logs
///
/// A pod left over from an earlier run with the same name is deleted first.
/// A pod ending in `Failed` is reported as a command error carrying its logs.
pub async fn run_node_script(client: &Client, script: &NodeScript) -> Result<ScriptOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &script.namespace);

    delete_pod(client, &script.namespace, &script.name).await?;
    crate::retry::poll_until(
        Duration::from_secs(60),
        POD_POLL_INTERVAL,
        &format!("stale pod {} to be removed", script.name),
        || async {
            match pods.get_opt(&script.name).await? {
                Some(_) => Ok(false),
                None => Ok(true),
            }
        },
    )
    .await?;

    info!(node = %script.node, pod = %script.name, "Running script on node");
    pods.create(&PostParams::default(), &script.pod())
        .await
        .map_err(|e| Error::from(e).with_context(&format!("creating pod {}", script.name)))?;

    let strategy = RetryStrategy::linear(POD_POLL_INTERVAL, script.timeout);
    let phase = poll(&strategy, &format!("pod {} to finish", script.name), || async {
        let pod = pods.get(&script.name).await?;
        Ok(match terminal_phase(&pod) {
            Some(p) => Poll::Ready(p.to_string()),
            None => Poll::Pending,
        })
    })
    .await?;

    let logs = match pods.logs(&script.name, &LogParams::default()).await {
        Ok(l) => l,
        Err(e) => {
            warn!(pod = %script.name, error = %e, "Failed to read pod logs");
            String::new()
        }
    };
    debug!(pod = %script.name, phase = %phase, "Script pod finished");

    if script.delete_after {
        delete_pod(client, &script.namespace, &script.name).await?;
    }

    if phase == "Failed" {
        return Err(Error::command(
            format!("script on node {}", script.node),
            logs.trim().to_string(),
        ));
    }
    Ok(ScriptOutput {
        node: script.node.clone(),
        logs,
    })
}

/// Delete a pod by name; absent pods are not an error
pub async fn delete_pod(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.delete(name, &DeleteParams::default().grace_period(0)).await {
        Ok(_) => {
            debug!(pod = %name, "Deleted pod");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::from(e).with_context(&format!("deleting pod {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    #[test]
    fn pod_is_pinned_privileged_and_mounts_host_root() {
        let pod = NodeScript::new("w1", "ocne-system", "ocne-update-w1", "echo hi")
            .with_env("TARGET", "1.30")
            .pod();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("w1"));
        assert_eq!(spec.host_pid, Some(true));
        let c = &spec.containers[0];
        assert_eq!(c.security_context.as_ref().unwrap().privileged, Some(true));
        let cmd = c.command.as_ref().unwrap();
        assert_eq!(cmd[..2], ["chroot".to_string(), HOST_ROOT.to_string()]);
        assert_eq!(cmd.last().unwrap(), "echo hi");
        assert_eq!(c.env.as_ref().unwrap()[0].name, "TARGET");
        assert_eq!(
            spec.volumes.unwrap()[0].host_path.as_ref().unwrap().path,
            "/"
        );
    }

    #[test]
    fn unchrooted_script_mounts_config_maps() {
        let pod = NodeScript::new("w1", "ocne-system", "convert", "ls /in")
            .without_chroot()
            .with_image("ghcr.io/example/tools:1")
            .with_config_map("boot-image", "/in")
            .pod();
        let spec = pod.spec.unwrap();
        let c = &spec.containers[0];
        assert_eq!(c.command.as_ref().unwrap()[0], "sh");
        assert_eq!(c.image.as_deref(), Some("ghcr.io/example/tools:1"));
        let mounts = c.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[1].mount_path, "/in");
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes[1].config_map.as_ref().unwrap().name, "boot-image");
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        let with_phase = |p: &str| Pod {
            status: Some(PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(terminal_phase(&with_phase("Succeeded")), Some("Succeeded"));
        assert_eq!(terminal_phase(&with_phase("Failed")), Some("Failed"));
        assert_eq!(terminal_phase(&with_phase("Running")), None);
        assert_eq!(terminal_phase(&Pod::default()), None);
    }
}
