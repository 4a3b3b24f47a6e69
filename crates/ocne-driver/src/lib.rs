//! Cluster drivers for ocne
//!
//! A [`Driver`] runs the whole life of a cluster on one kind of
//! infrastructure:
//!
//! - [`LibvirtDriver`] boots nodes as domains on a hypervisor
//! - [`OciDriver`] creates Cluster API resources for OCI on a management cluster
//! - [`NoneDriver`] wraps a cluster managed out of band
//!
//! [`create_driver`] picks one from the cluster configuration and the
//! functions in [`ops`] run whole operations over it. Each driver
//! tracks the cluster's [`LifecycleState`] and rejects operations that make
//! no sense in it.

#![deny(missing_docs)]

pub mod driver;
pub mod factory;
pub mod libvirt;
pub mod none;
pub mod oci;
pub mod ops;

pub use driver::{
    node_update_help, Driver, IllegalTransition, Lifecycle, LifecycleState, StageOutcome, StartOutcome,
};
pub use factory::create_driver;
pub use libvirt::LibvirtDriver;
pub use none::NoneDriver;
pub use oci::OciDriver;
pub use ops::{delete_cluster, join_cluster, stage_cluster, start_cluster, StartReport};
