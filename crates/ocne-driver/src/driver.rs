//! The driver contract and the cluster lifecycle it walks through

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use ocne_common::{Error, Result, ANNOTATION_UPDATE_AVAILABLE};

pub use ocne_libvirt::StartOutcome;

/// What a staging run produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageOutcome {
    /// Kubeconfig of the cluster being staged
    pub kubeconfig: PathBuf,
    /// Instructions for finishing the upgrade
    pub help_text: String,
    /// Whether anything on the platform was created
    pub changed: bool,
}

/// One way of running clusters
///
/// Every mutating operation is safe to retry. `delete` makes progress toward
/// "no resources" and tolerates resources that are already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Bring the cluster up, or report that it already answers
    async fn start(&mut self) -> Result<StartOutcome>;

    /// Pivot the cluster onto itself if it is self-managed
    async fn post_start(&mut self) -> Result<()>;

    /// Add nodes to the running cluster behind `kubeconfig`
    async fn join(&mut self, kubeconfig: &Path, control_planes: u32, workers: u32) -> Result<()>;

    /// Shut the cluster's nodes down
    async fn stop(&mut self) -> Result<()>;

    /// Remove everything the cluster owns
    async fn delete(&mut self) -> Result<()>;

    /// Release local resources held by the driver
    fn close(&mut self) -> Result<()>;

    /// Prepare the cluster for kubernetes `version`
    async fn stage(&mut self, version: &str) -> Result<StageOutcome>;

    /// Kubeconfig of the cluster, once known
    fn kubeconfig_path(&self) -> Option<PathBuf>;

    /// Address of the cluster's API server
    fn kube_api_server_address(&self) -> Result<String>;

    /// Text shown after a successful install
    fn post_install_help_stanza(&self) -> String;

    /// Interfaces the CNI should bind to; empty lets it choose
    fn default_cni_interfaces(&self) -> Vec<String>;

    /// Where the cluster is in its lifecycle as far as this driver knows
    fn state(&self) -> LifecycleState;
}

/// Lifecycle of one cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Nothing exists
    #[default]
    Absent,
    /// Network resources are reserved and the first control plane is booting
    Bootstrapping,
    /// The first control plane answers node lists
    ControlPlaneReady,
    /// Further nodes are being added one at a time
    WorkersJoining,
    /// Every requested node is part of the cluster
    Ready,
    /// An upgrade has been prepared; no node has changed yet
    UpgradeStaged,
    /// Resources are being removed
    Deleting,
}

impl LifecycleState {
    /// Label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Bootstrapping => "bootstrapping",
            Self::ControlPlaneReady => "control-plane-ready",
            Self::WorkersJoining => "workers-joining",
            Self::Ready => "ready",
            Self::UpgradeStaged => "upgrade-staged",
            Self::Deleting => "deleting",
        }
    }

    /// True if `self -> to` is an edge of the lifecycle
    ///
    /// Staging may repeat. A ready cluster may take on more nodes. Any
    /// state may move to deleting, and only deleting reaches absent.
    pub fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (*self, to) {
            (_, Deleting) => true,
            (Deleting, Absent) => true,
            (Absent, Bootstrapping) => true,
            (Bootstrapping, ControlPlaneReady) => true,
            (ControlPlaneReady, WorkersJoining) => true,
            (WorkersJoining, Ready) => true,
            (Ready, UpgradeStaged) => true,
            (UpgradeStaged, UpgradeStaged) => true,
            (UpgradeStaged, Ready) => true,
            (Ready, WorkersJoining) => true,
            _ => false,
        }
    }

    /// The state after `self -> to`, or an error for an illegal edge
    pub fn transition(self, to: LifecycleState) -> std::result::Result<LifecycleState, IllegalTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition the lifecycle does not allow
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot move from {from} to {to}")]
pub struct IllegalTransition {
    /// Current state
    pub from: LifecycleState,
    /// Requested state
    pub to: LifecycleState,
}

/// The lifecycle of one named cluster, logged as it moves
#[derive(Clone, Debug)]
pub struct Lifecycle {
    cluster: String,
    state: LifecycleState,
}

impl Lifecycle {
    /// A cluster not known to exist yet
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            state: LifecycleState::Absent,
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move to `to`
    pub fn advance(&mut self, to: LifecycleState) -> Result<()> {
        self.state = self
            .state
            .transition(to)
            .map_err(|e| Error::precondition(self.cluster.clone(), e.to_string()))?;
        info!(cluster = %self.cluster, state = %self.state, "Cluster lifecycle");
        Ok(())
    }

    /// Record that a cluster this driver did not create is up
    pub fn observe_running(&mut self) {
        if self.state == LifecycleState::Absent {
            debug!(cluster = %self.cluster, "Found running cluster");
            self.state = LifecycleState::Ready;
        }
    }

    /// Put the state back to `to` after an operation failed part way
    ///
    /// Nothing is rolled back on the platform. Retrying the operation walks
    /// the same edges again.
    pub fn restore(&mut self, to: LifecycleState) {
        if self.state != to {
            warn!(cluster = %self.cluster, from = %self.state, to = %to, "Operation failed, restoring lifecycle state");
            self.state = to;
        }
    }
}

/// Instructions for rolling nodes that update in place
pub fn node_update_help(cluster: &str, version: &str, kubeconfig: &Path) -> String {
    let kubeconfig = kubeconfig.display();
    format!(
        "Nodes of cluster {cluster} download the Kubernetes {version} image on their own.\n\
         Nodes ready to update carry the {ANNOTATION_UPDATE_AVAILABLE} annotation:\n\n    \
         kubectl --kubeconfig {kubeconfig} get nodes -o custom-columns='NAME:.metadata.name,UPDATE:.metadata.annotations.ocne\\.oracle\\.com/update-available'\n\n\
         Update them one at a time, control plane nodes first:\n\n    \
         ocne node update --kubeconfig {kubeconfig} --node <name>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn story_cluster_lives_and_dies() {
        let mut lc = Lifecycle::new("demo");
        for to in [Bootstrapping, ControlPlaneReady, WorkersJoining, Ready] {
            lc.advance(to).unwrap();
        }
        assert_eq!(lc.state(), Ready);

        lc.advance(UpgradeStaged).unwrap();
        lc.advance(UpgradeStaged).unwrap();
        lc.advance(Ready).unwrap();

        lc.advance(WorkersJoining).unwrap();
        lc.advance(Ready).unwrap();

        lc.advance(Deleting).unwrap();
        lc.advance(Absent).unwrap();
        assert_eq!(lc.state(), Absent);
    }

    #[test]
    fn illegal_edges_are_rejected() {
        assert_eq!(
            Absent.transition(Ready),
            Err(IllegalTransition { from: Absent, to: Ready })
        );
        assert!(!Bootstrapping.can_transition(Ready));
        assert!(!Ready.can_transition(Absent));
        assert!(!WorkersJoining.can_transition(UpgradeStaged));
        assert!(!Absent.can_transition(UpgradeStaged));
    }

    #[test]
    fn any_state_may_be_deleted() {
        for from in [Absent, Bootstrapping, ControlPlaneReady, WorkersJoining, Ready, UpgradeStaged, Deleting] {
            assert!(from.can_transition(Deleting), "{from}");
        }
    }

    #[test]
    fn failed_transition_is_a_precondition_error() {
        let mut lc = Lifecycle::new("demo");
        let err = lc.advance(ControlPlaneReady).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert_eq!(lc.state(), Absent);
    }

    #[test]
    fn failed_bring_up_can_start_over() {
        let mut lc = Lifecycle::new("demo");
        lc.advance(Bootstrapping).unwrap();
        lc.advance(ControlPlaneReady).unwrap();
        assert!(lc.advance(Bootstrapping).is_err());

        lc.restore(Absent);
        assert_eq!(lc.state(), Absent);
        lc.advance(Bootstrapping).unwrap();
    }

    #[test]
    fn observing_a_running_cluster_only_moves_from_absent() {
        let mut lc = Lifecycle::new("demo");
        lc.observe_running();
        assert_eq!(lc.state(), Ready);

        lc.advance(UpgradeStaged).unwrap();
        lc.observe_running();
        assert_eq!(lc.state(), UpgradeStaged);
    }

    #[test]
    fn update_help_points_at_node_update() {
        let help = node_update_help("demo", "1.31", Path::new("/tmp/kc"));
        assert!(help.contains("ocne node update --kubeconfig /tmp/kc --node <name>"));
        assert!(help.contains(ANNOTATION_UPDATE_AVAILABLE));
    }
}
