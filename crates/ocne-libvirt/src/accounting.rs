//! Network accounting for hypervisor clusters
//!
//! Every cluster on a hypervisor host needs an API server port on that host
//! and, on routed networks, an address in the libvirt network. Allocations are
//! recorded in `~/.ocne/ips.yaml` so that separate invocations (and separate
//! processes) never hand out the same pair twice:
//!
//! ```yaml
//! Hosts:
//!   localhost:
//!     IPs: []
//!     Ports: [6443, 6444]
//! Clusters:
//!   demo:
//!     Host: localhost
//!     IP: 127.0.0.1
//!     Port: 6443
//! ```
//!
//! The document is reloaded on every operation and every read-modify-write
//! runs under an advisory lock on a file next to it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use ocne_common::paths;

use crate::xml::NetworkInfo;

/// How long to wait for another process to release the lock
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// First port handed out for API servers
pub const FIRST_API_PORT: u16 = 6443;

/// Last port handed out for API servers
pub const LAST_API_PORT: u16 = 65534;

/// Offset into the subnet where address allocation starts
pub const IP_SCAN_OFFSET: u32 = 200;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Network accounting errors
#[derive(Debug, Error)]
pub enum AccountingError {
    /// Another process held the lock for too long
    #[error("timed out after {seconds}s waiting for lock {path}")]
    LockTimeout {
        /// Lock file
        path: PathBuf,
        /// Timeout in seconds
        seconds: u64,
    },

    /// Every API port on a host is recorded as used
    #[error("no free API server ports left on host {host}")]
    PortsExhausted {
        /// Hypervisor host
        host: String,
    },

    /// Every address past the scan offset is recorded as used
    #[error("no free addresses left in subnet {subnet}")]
    SubnetExhausted {
        /// Network subnet
        subnet: String,
    },

    /// The subnet is too small for the scan offset
    #[error("address {cursor} is outside subnet {subnet}")]
    CursorOutsideSubnet {
        /// First address that would be scanned
        cursor: Ipv4Addr,
        /// Network subnet
        subnet: String,
    },

    /// The accounting document is malformed
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Accounting document
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AccountingError> for ocne_common::Error {
    fn from(e: AccountingError) -> Self {
        match e {
            AccountingError::LockTimeout { path, seconds } => ocne_common::Error::timeout(
                format!("lock {}", path.display()),
                Duration::from_secs(seconds),
            ),
            AccountingError::CursorOutsideSubnet { .. } => {
                ocne_common::Error::validation(e.to_string())
            }
            AccountingError::Parse { .. } => ocne_common::Error::serialization(e.to_string()),
            AccountingError::Io(io) => ocne_common::Error::Io(io),
            other => ocne_common::Error::fatal(other.to_string()),
        }
    }
}

/// Addresses and ports in use on one hypervisor host
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUsage {
    /// Addresses handed out on this host's networks
    #[serde(rename = "IPs", default)]
    pub ips: BTreeSet<Ipv4Addr>,
    /// API server ports bound on this host
    #[serde(rename = "Ports", default)]
    pub ports: BTreeSet<u16>,
}

/// Where one cluster's API server lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAllocation {
    /// Hypervisor host
    #[serde(rename = "Host")]
    pub host: String,
    /// API server address
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    /// API server port on the host
    #[serde(rename = "Port")]
    pub port: u16,
}

/// The accounting document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accounting {
    /// Usage per hypervisor host
    #[serde(rename = "Hosts", default)]
    pub hosts: BTreeMap<String, HostUsage>,
    /// Allocation per cluster
    #[serde(rename = "Clusters", default)]
    pub clusters: BTreeMap<String, ClusterAllocation>,
}

impl Accounting {
    /// Parse a document, treating an empty one as no allocations
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// First free API port on `host`
    pub fn next_free_port(&self, host: &str) -> Result<u16, AccountingError> {
        let used = self.hosts.get(host).map(|h| &h.ports);
        (FIRST_API_PORT..=LAST_API_PORT)
            .find(|p| used.is_none_or(|u| !u.contains(p)))
            .ok_or_else(|| AccountingError::PortsExhausted {
                host: host.to_string(),
            })
    }

    /// First free address on `host` at or past the scan offset of `network`
    pub fn next_free_ip(&self, host: &str, network: &NetworkInfo) -> Result<Ipv4Addr, AccountingError> {
        let subnet = network.subnet;
        let cursor = Ipv4Addr::from(u32::from(subnet.network()).saturating_add(IP_SCAN_OFFSET));
        if !subnet.contains(cursor) {
            return Err(AccountingError::CursorOutsideSubnet {
                cursor,
                subnet: subnet.to_string(),
            });
        }

        let used = self.hosts.get(host).map(|h| &h.ips);
        let broadcast = subnet.broadcast();
        (u32::from(cursor)..u32::from(broadcast))
            .map(Ipv4Addr::from)
            .find(|ip| *ip != network.gateway && used.is_none_or(|u| !u.contains(ip)))
            .ok_or_else(|| AccountingError::SubnetExhausted {
                subnet: subnet.to_string(),
            })
    }

    /// Mark a port used on `host`
    pub fn reserve_port(&mut self, host: &str, port: u16) {
        self.hosts.entry(host.to_string()).or_default().ports.insert(port);
    }

    /// Mark an address used on `host`; loopback is never recorded
    pub fn reserve_ip(&mut self, host: &str, ip: Ipv4Addr) {
        if ip == LOOPBACK {
            return;
        }
        self.hosts.entry(host.to_string()).or_default().ips.insert(ip);
    }

    /// Record a cluster's API endpoint
    pub fn add_cluster(&mut self, host: &str, cluster: &str, ip: Ipv4Addr, port: u16) {
        self.reserve_ip(host, ip);
        self.reserve_port(host, port);
        self.clusters.insert(
            cluster.to_string(),
            ClusterAllocation {
                host: host.to_string(),
                ip,
                port,
            },
        );
    }

    /// The endpoint recorded for `cluster` on `host`, or a fresh one
    ///
    /// Without a network the cluster is reached through loopback and only a
    /// port is taken. A cluster recorded on another host is moved.
    pub fn reserve_cluster(
        &mut self,
        host: &str,
        cluster: &str,
        network: Option<&NetworkInfo>,
    ) -> Result<ClusterAllocation, AccountingError> {
        match self.clusters.get(cluster) {
            Some(alloc) if alloc.host == host => return Ok(alloc.clone()),
            Some(_) => {
                self.remove_cluster(cluster);
            }
            None => {}
        }
        let port = self.next_free_port(host)?;
        let ip = match network {
            Some(network) => self.next_free_ip(host, network)?,
            None => LOOPBACK,
        };
        self.add_cluster(host, cluster, ip, port);
        Ok(ClusterAllocation {
            host: host.to_string(),
            ip,
            port,
        })
    }

    /// Forget a cluster and release its address and port
    pub fn remove_cluster(&mut self, cluster: &str) -> Option<ClusterAllocation> {
        let alloc = self.clusters.remove(cluster)?;
        if let Some(usage) = self.hosts.get_mut(&alloc.host) {
            usage.ips.remove(&alloc.ip);
            usage.ports.remove(&alloc.port);
            if usage.ips.is_empty() && usage.ports.is_empty() {
                self.hosts.remove(&alloc.host);
            }
        }
        Some(alloc)
    }
}

/// Exclusive advisory lock on a file next to the document
///
/// The lock belongs to the open file description, so the kernel drops it when
/// the holder exits. A lock file left behind by a dead process is reused.
pub struct FileLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    /// Lock `path`, waiting up to `timeout` for a holder to release it
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, AccountingError> {
        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!(lock = %path.display(), "Acquired lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _lock: lock,
                    });
                }
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    if start.elapsed() >= timeout {
                        return Err(AccountingError::LockTimeout {
                            path: path.to_path_buf(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
            }
        }
    }
}

/// The persisted accounting document
#[derive(Clone, Debug)]
pub struct NetworkAccounting {
    path: PathBuf,
    lock_timeout: Duration,
}

impl NetworkAccounting {
    /// Accounting stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Accounting stored at `~/.ocne/ips.yaml`
    pub fn default_location() -> ocne_common::Result<Self> {
        Ok(Self::new(paths::ips_file()?))
    }

    /// Override the lock acquisition timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document without locking
    pub fn load(&self) -> Result<Accounting, AccountingError> {
        let yaml = match std::fs::read_to_string(&self.path) {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Accounting::default()),
            Err(e) => return Err(e.into()),
        };
        Accounting::from_yaml(&yaml).map_err(|e| AccountingError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn store(&self, accounting: &Accounting) -> Result<(), AccountingError> {
        let yaml = serde_yaml::to_string(accounting).map_err(|e| AccountingError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| AccountingError::Io(e.error))?;
        Ok(())
    }

    /// Run `f` against the document under the lock, saving the result
    async fn update<T>(
        &self,
        f: impl FnOnce(&mut Accounting) -> Result<T, AccountingError>,
    ) -> Result<T, AccountingError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let _lock = FileLock::acquire(&paths::lock_file_for(&self.path), self.lock_timeout).await?;
        let mut accounting = self.load()?;
        let out = f(&mut accounting)?;
        self.store(&accounting)?;
        Ok(out)
    }

    /// Hand out the next API port on `host`
    pub async fn allocate_port(&self, host: &str) -> Result<u16, AccountingError> {
        let port = self
            .update(|acct| {
                let port = acct.next_free_port(host)?;
                acct.reserve_port(host, port);
                Ok(port)
            })
            .await?;
        info!(host, port, "Allocated API server port");
        Ok(port)
    }

    /// Hand out the next address in `network` on `host`
    pub async fn allocate_ip(&self, host: &str, network: &NetworkInfo) -> Result<Ipv4Addr, AccountingError> {
        let ip = self
            .update(|acct| {
                let ip = acct.next_free_ip(host, network)?;
                acct.reserve_ip(host, ip);
                Ok(ip)
            })
            .await?;
        info!(host, ip = %ip, "Allocated API server address");
        Ok(ip)
    }

    /// Record a cluster's API endpoint
    pub async fn add_cluster(
        &self,
        host: &str,
        cluster: &str,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<(), AccountingError> {
        self.update(|acct| {
            acct.add_cluster(host, cluster, ip, port);
            Ok(())
        })
        .await?;
        info!(host, cluster, ip = %ip, port, "Recorded cluster endpoint");
        Ok(())
    }

    /// Reserve the API endpoint of `cluster` and record it in one update
    ///
    /// Calling this again for the same cluster returns the same endpoint.
    pub async fn reserve_cluster(
        &self,
        host: &str,
        cluster: &str,
        network: Option<&NetworkInfo>,
    ) -> Result<ClusterAllocation, AccountingError> {
        let alloc = self
            .update(|acct| acct.reserve_cluster(host, cluster, network))
            .await?;
        info!(host, cluster, ip = %alloc.ip, port = alloc.port, "Reserved cluster endpoint");
        Ok(alloc)
    }

    /// Forget a cluster, releasing its allocations
    pub async fn remove_cluster(&self, cluster: &str) -> Result<Option<ClusterAllocation>, AccountingError> {
        let removed = self.update(|acct| Ok(acct.remove_cluster(cluster))).await?;
        if removed.is_some() {
            info!(cluster, "Released cluster endpoint");
        }
        Ok(removed)
    }

    /// The recorded endpoint of a cluster
    pub fn cluster(&self, cluster: &str) -> Result<Option<ClusterAllocation>, AccountingError> {
        Ok(self.load()?.clusters.get(cluster).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnetwork::Ipv4Network;

    fn network(cidr: &str, gateway: &str) -> NetworkInfo {
        NetworkInfo {
            gateway: gateway.parse().unwrap(),
            subnet: cidr.parse::<Ipv4Network>().unwrap(),
        }
    }

    fn accounting() -> (tempfile::TempDir, NetworkAccounting) {
        let dir = tempfile::tempdir().unwrap();
        let acct = NetworkAccounting::new(dir.path().join("ips.yaml"));
        (dir, acct)
    }

    #[tokio::test]
    async fn story_ports_continue_after_used_ones() {
        let (_dir, acct) = accounting();
        acct.allocate_port("h1").await.unwrap();
        acct.allocate_port("h1").await.unwrap();
        assert_eq!(
            acct.load().unwrap().hosts["h1"].ports,
            BTreeSet::from([6443, 6444])
        );

        assert_eq!(acct.allocate_port("h1").await.unwrap(), 6445);
        assert_eq!(acct.allocate_port("h1").await.unwrap(), 6446);
        assert_eq!(acct.allocate_port("h2").await.unwrap(), 6443);
    }

    #[tokio::test]
    async fn story_localhost_address_is_reusable() {
        let (_dir, acct) = accounting();
        acct.add_cluster("h1", "demo", LOOPBACK, 6443).await.unwrap();

        let doc = acct.load().unwrap();
        assert_eq!(
            doc.clusters["demo"],
            ClusterAllocation {
                host: "h1".to_string(),
                ip: LOOPBACK,
                port: 6443
            }
        );
        assert!(!doc.hosts["h1"].ips.contains(&LOOPBACK));
        assert!(doc.hosts["h1"].ports.contains(&6443));
    }

    #[tokio::test]
    async fn allocations_on_a_host_never_repeat() {
        let (_dir, acct) = accounting();
        let net = network("192.168.122.0/24", "192.168.122.1");
        let mut seen = BTreeSet::new();
        for i in 0..5 {
            let port = acct.allocate_port("h1").await.unwrap();
            let ip = acct.allocate_ip("h1", &net).await.unwrap();
            acct.add_cluster("h1", &format!("c{i}"), ip, port).await.unwrap();
            assert!(seen.insert((ip, port)));
        }
        let doc = acct.load().unwrap();
        assert_eq!(doc.hosts["h1"].ips.len(), 5);
        assert_eq!(doc.hosts["h1"].ports.len(), 5);
    }

    #[test]
    fn document_survives_reparsing() {
        let mut doc = Accounting::default();
        doc.add_cluster("h1", "a", "192.168.122.200".parse().unwrap(), 6443);
        doc.add_cluster("h1", "b", LOOPBACK, 6444);
        doc.add_cluster("10.0.0.5", "c", "10.0.0.201".parse().unwrap(), 6443);

        let yaml = serde_yaml::to_string(&doc).unwrap();
        assert!(yaml.contains("Hosts:"));
        assert!(yaml.contains("IPs:"));
        assert!(yaml.contains("Clusters:"));
        assert_eq!(Accounting::from_yaml(&yaml).unwrap(), doc);
    }

    #[test]
    fn empty_document_has_no_allocations() {
        assert_eq!(Accounting::from_yaml("").unwrap(), Accounting::default());
    }

    #[test]
    fn free_port_is_the_first_api_port() {
        assert_eq!(Accounting::default().next_free_port("h1").unwrap(), 6443);
    }

    #[test]
    fn exhausted_ports_are_an_error() {
        let mut doc = Accounting::default();
        doc.hosts.insert(
            "h1".to_string(),
            HostUsage {
                ips: BTreeSet::new(),
                ports: (FIRST_API_PORT..=LAST_API_PORT).collect(),
            },
        );
        assert!(matches!(
            doc.next_free_port("h1"),
            Err(AccountingError::PortsExhausted { .. })
        ));
    }

    #[test]
    fn address_scan_starts_past_the_offset() {
        let net = network("192.168.122.0/24", "192.168.122.1");
        let mut doc = Accounting::default();
        assert_eq!(
            doc.next_free_ip("h1", &net).unwrap(),
            "192.168.122.200".parse::<Ipv4Addr>().unwrap()
        );
        doc.reserve_ip("h1", "192.168.122.200".parse().unwrap());
        assert_eq!(
            doc.next_free_ip("h1", &net).unwrap(),
            "192.168.122.201".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn small_subnets_are_rejected_before_scanning() {
        let net = network("192.168.10.0/25", "192.168.10.1");
        let err = Accounting::default().next_free_ip("h1", &net).unwrap_err();
        assert!(matches!(err, AccountingError::CursorOutsideSubnet { .. }));
    }

    #[test]
    fn full_subnet_is_exhausted() {
        let net = network("192.168.122.0/24", "192.168.122.1");
        let mut doc = Accounting::default();
        for last in 200..255u8 {
            doc.reserve_ip("h1", Ipv4Addr::new(192, 168, 122, last));
        }
        assert!(matches!(
            doc.next_free_ip("h1", &net),
            Err(AccountingError::SubnetExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn removing_a_cluster_frees_its_endpoint() {
        let (_dir, acct) = accounting();
        let ip: Ipv4Addr = "192.168.122.200".parse().unwrap();
        acct.add_cluster("h1", "demo", ip, 6443).await.unwrap();

        let removed = acct.remove_cluster("demo").await.unwrap();
        assert_eq!(removed.map(|a| a.port), Some(6443));
        assert_eq!(acct.load().unwrap(), Accounting::default());
        assert!(acct.remove_cluster("demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let (_dir, acct) = accounting();
        let acct = acct.with_lock_timeout(Duration::from_millis(250));
        let held = FileLock::acquire(&paths::lock_file_for(acct.path()), LOCK_TIMEOUT)
            .await
            .unwrap();

        let err = acct.allocate_port("h1").await.unwrap_err();
        assert!(matches!(err, AccountingError::LockTimeout { .. }));

        drop(held);
        assert_eq!(acct.allocate_port("h1").await.unwrap(), 6443);
    }

    #[tokio::test]
    async fn lock_left_by_a_dead_holder_is_reused() {
        let (_dir, acct) = accounting();
        let acct = acct.with_lock_timeout(Duration::from_millis(500));
        std::fs::write(paths::lock_file_for(acct.path()), "999999\n").unwrap();

        assert_eq!(acct.allocate_port("localhost").await.unwrap(), 6443);
        assert_eq!(acct.allocate_port("localhost").await.unwrap(), 6444);
    }

    #[tokio::test]
    async fn reserving_a_cluster_again_returns_its_endpoint() {
        let (_dir, acct) = accounting();
        let net = network("192.168.122.0/24", "192.168.122.1");
        let first = acct.reserve_cluster("h1", "demo", Some(&net)).await.unwrap();
        let again = acct.reserve_cluster("h1", "demo", Some(&net)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.ip, Ipv4Addr::new(192, 168, 122, 200));

        let doc = acct.load().unwrap();
        assert_eq!(doc.hosts["h1"].ports, BTreeSet::from([6443]));
        assert_eq!(doc.clusters["demo"], first);

        acct.remove_cluster("demo").await.unwrap();
        assert_eq!(acct.load().unwrap(), Accounting::default());
    }

    #[test]
    fn loopback_reservations_only_take_a_port() {
        let mut doc = Accounting::default();
        let alloc = doc.reserve_cluster("localhost", "demo", None).unwrap();
        assert_eq!(alloc.ip, LOOPBACK);
        assert!(doc.hosts["localhost"].ips.is_empty());

        let moved = doc.reserve_cluster("h2", "demo", None).unwrap();
        assert_eq!(moved.host, "h2");
        assert!(!doc.hosts.contains_key("localhost"));
    }

    #[test]
    fn lock_timeout_maps_to_timeout_error() {
        let err: ocne_common::Error = AccountingError::LockTimeout {
            path: PathBuf::from("/tmp/ips.yaml.lock"),
            seconds: 10,
        }
        .into();
        assert!(matches!(err, ocne_common::Error::Timeout { seconds: 10, .. }));
    }
}
