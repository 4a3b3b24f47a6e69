//! Hypervisor provisioner for ocne
//!
//! Clusters run as libvirt domains on a local or remote hypervisor. Nodes boot
//! from a shared boot volume extracted from the OCK container image and are
//! configured on first boot by an ignition document delivered through fw_cfg.
//! API server addresses and host ports are recorded in a lock-protected file
//! so that concurrent clusters on the same host never collide.

#![deny(missing_docs)]

pub mod accounting;
pub mod hypervisor;
pub mod ignition;
pub mod pool;
pub mod provisioner;
pub mod uri;
pub mod xml;

pub use accounting::{Accounting, AccountingError, NetworkAccounting};
pub use hypervisor::{Hypervisor, VirshHypervisor};
pub use provisioner::{domain_name, NodeRole, Provisioner, StartOutcome};
pub use uri::SessionUri;
