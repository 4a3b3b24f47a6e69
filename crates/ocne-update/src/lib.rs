//! Rolling node updates for ocne
//!
//! Nodes run an immutable ostree image. The node OS stages updates on its own
//! and announces them with the `ocne.oracle.com/update-available` annotation;
//! this crate applies them one node at a time:
//!
//! - [`pre_update`] prepares clusters created with older images by retagging
//!   node-local images and adopting kube-proxy and CoreDNS as managed apps
//! - [`update_node`] cordons, drains, deploys the staged commit, waits out the
//!   reboot and uncordons
//!
//! Everything touching the cluster goes through [`NodeOps`].

#![deny(missing_docs)]

pub mod apps;
pub mod gate;
pub mod ops;
pub mod preupdate;
pub mod roll;
pub mod scripts;

pub use apps::{adopt_managed_apps, AppInstaller, HelmInstaller, ManagedApp};
pub use gate::{check_worker_gate, update_available};
pub use ops::{DrainError, DrainOptions, DrainReport, KubeNodeOps, NodeOps};
pub use preupdate::{pre_update, PreUpdateOptions, PreUpdateReport, RETAG_KUBELET_THRESHOLD};
pub use roll::{update_node, update_nodes, UpdateOptions};
