//! libvirt XML descriptors
//!
//! Domains, volumes and pools are rendered from templates. Network and pool
//! descriptions read back from libvirt are parsed with `quick-xml`.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use minijinja::Environment;
use serde::{Deserialize, Serialize};

use ocne_common::{Error, Result};

const DOMAIN_TEMPLATE: &str = include_str!("../templates/domain.xml.j2");
const VOLUME_TEMPLATE: &str = include_str!("../templates/volume.xml.j2");
const POOL_TEMPLATE: &str = include_str!("../templates/pool.xml.j2");

/// Port the API server listens on inside a node
pub const GUEST_API_PORT: u16 = 6443;

fn render<S: Serialize>(name: &str, source: &str, ctx: &S) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .map_err(|e| Error::validation(format!("invalid {name} template: {e}")))?;
    env.get_template(name)
        .map_err(|e| Error::validation(format!("{name} template not found: {e}")))?
        .render(ctx)
        .map_err(|e| Error::serialization(format!("failed to render {name} template: {e}")))
}

/// How a node interface is attached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Unprivileged user networking, optionally forwarding a host port to the API server
    User {
        /// Host port forwarded to the guest API port
        forward_port: Option<u16>,
    },
    /// A libvirt virtual network
    Network(String),
    /// A host bridge
    Bridge(String),
}

/// A network interface at a fixed PCI address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Attachment
    pub kind: InterfaceKind,
    /// PCI bus
    pub bus: u8,
    /// PCI slot
    pub slot: u8,
}

impl InterfaceSpec {
    /// Name the guest gives the device, derived from its PCI address
    pub fn guest_device(&self) -> String {
        format!("enp{}s{}", self.bus, self.slot)
    }
}

#[derive(Serialize)]
struct InterfaceView {
    kind: &'static str,
    source: String,
    forward_port: Option<u16>,
    pci_bus: String,
    pci_slot: String,
}

impl From<&InterfaceSpec> for InterfaceView {
    fn from(spec: &InterfaceSpec) -> Self {
        let (kind, source, forward_port) = match &spec.kind {
            InterfaceKind::User { forward_port } => ("user", String::new(), *forward_port),
            InterfaceKind::Network(n) => ("network", n.clone(), None),
            InterfaceKind::Bridge(b) => ("bridge", b.clone(), None),
        };
        Self {
            kind,
            source,
            forward_port,
            pci_bus: format!("0x{:02x}", spec.bus),
            pci_slot: format!("0x{:02x}", spec.slot),
        }
    }
}

/// Everything needed to define one node domain
#[derive(Clone, Debug)]
pub struct DomainSpec {
    /// Domain name
    pub name: String,
    /// Memory in KiB
    pub memory_kib: u64,
    /// Virtual CPUs
    pub vcpus: u32,
    /// Guest architecture (`x86_64`, `aarch64`)
    pub arch: String,
    /// Boot disk volume path
    pub disk_path: String,
    /// Ignition volume path, handed to the guest through fw_cfg
    pub ignition_path: String,
    /// Network interfaces
    pub interfaces: Vec<InterfaceSpec>,
}

#[derive(Serialize)]
struct DomainView<'a> {
    name: &'a str,
    memory_kib: u64,
    vcpus: u32,
    arch: &'a str,
    machine: &'a str,
    disk_path: &'a str,
    ignition_path: &'a str,
    api_port: u16,
    interfaces: Vec<InterfaceView>,
}

impl DomainSpec {
    /// Render the domain XML
    pub fn to_xml(&self) -> Result<String> {
        let machine = if self.arch == "aarch64" { "virt" } else { "q35" };
        let view = DomainView {
            name: &self.name,
            memory_kib: self.memory_kib,
            vcpus: self.vcpus,
            arch: &self.arch,
            machine,
            disk_path: &self.disk_path,
            ignition_path: &self.ignition_path,
            api_port: GUEST_API_PORT,
            interfaces: self.interfaces.iter().map(InterfaceView::from).collect(),
        };
        render("domain", DOMAIN_TEMPLATE, &view)
    }
}

/// Guest architecture matching this machine
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "aarch64",
        _ => "x86_64",
    }
}

/// A storage volume
#[derive(Clone, Debug, Serialize)]
pub struct VolumeSpec {
    /// Volume name
    pub name: String,
    /// Capacity in bytes
    pub capacity: u64,
    /// Volume format (`qcow2`, `raw`)
    pub format: String,
    /// Backing volume path for copy-on-write volumes
    pub backing_path: Option<String>,
}

impl VolumeSpec {
    /// A qcow2 volume
    pub fn qcow2(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            format: "qcow2".to_string(),
            backing_path: None,
        }
    }

    /// A raw volume
    pub fn raw(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            format: "raw".to_string(),
            backing_path: None,
        }
    }

    /// Back this volume with another
    pub fn backed_by(mut self, path: impl Into<String>) -> Self {
        self.backing_path = Some(path.into());
        self
    }

    /// Render the volume XML
    pub fn to_xml(&self) -> Result<String> {
        render("volume", VOLUME_TEMPLATE, self)
    }
}

/// A directory storage pool
#[derive(Clone, Debug, Serialize)]
pub struct PoolSpec {
    /// Pool name
    pub name: String,
    /// Directory on the hypervisor host
    pub path: String,
}

impl PoolSpec {
    /// Render the pool XML
    pub fn to_xml(&self) -> Result<String> {
        render("pool", POOL_TEMPLATE, self)
    }
}

#[derive(Deserialize)]
struct NetworkDoc {
    #[serde(default)]
    ip: Vec<NetworkIp>,
}

#[derive(Deserialize)]
struct NetworkIp {
    #[serde(rename = "@address")]
    address: String,
    #[serde(rename = "@netmask")]
    netmask: Option<String>,
    #[serde(rename = "@prefix")]
    prefix: Option<u8>,
    #[serde(rename = "@family")]
    family: Option<String>,
}

/// Addressing of a libvirt network
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Host-side address of the network
    pub gateway: Ipv4Addr,
    /// The network's subnet
    pub subnet: Ipv4Network,
}

impl NetworkInfo {
    /// Parse the IPv4 addressing out of `virsh net-dumpxml` output
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc: NetworkDoc = quick_xml::de::from_str(xml)
            .map_err(|e| Error::serialization(format!("invalid network XML: {e}")))?;
        let ip = doc
            .ip
            .into_iter()
            .find(|ip| ip.family.as_deref().is_none_or(|f| f == "ipv4"))
            .ok_or_else(|| Error::not_found("IPv4 address", "network"))?;

        let gateway: Ipv4Addr = ip
            .address
            .parse()
            .map_err(|e| Error::validation(format!("invalid network address {}: {e}", ip.address)))?;
        let subnet = match (ip.netmask, ip.prefix) {
            (Some(mask), _) => {
                let mask: Ipv4Addr = mask
                    .parse()
                    .map_err(|e| Error::validation(format!("invalid netmask {mask}: {e}")))?;
                Ipv4Network::with_netmask(gateway, mask)
            }
            (None, Some(prefix)) => Ipv4Network::new(gateway, prefix),
            (None, None) => Ipv4Network::new(gateway, 24),
        }
        .map_err(|e| Error::validation(format!("invalid network mask: {e}")))?;
        let subnet = Ipv4Network::new(subnet.network(), subnet.prefix())
            .map_err(|e| Error::validation(format!("invalid network mask: {e}")))?;

        Ok(Self { gateway, subnet })
    }
}

#[derive(Deserialize)]
struct PoolDoc {
    name: String,
    target: Option<PoolTarget>,
}

#[derive(Deserialize)]
struct PoolTarget {
    path: String,
}

/// Name and directory of an existing pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    /// Pool name
    pub name: String,
    /// Target directory, if the pool has one
    pub path: Option<PathBuf>,
}

impl PoolInfo {
    /// Parse `virsh pool-dumpxml` output
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc: PoolDoc = quick_xml::de::from_str(xml)
            .map_err(|e| Error::serialization(format!("invalid pool XML: {e}")))?;
        Ok(Self {
            name: doc.name,
            path: doc.target.map(|t| PathBuf::from(t.path)),
        })
    }
}

/// Parse a Kubernetes-style quantity (`16Gi`, `512M`, `1024`) into bytes
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::validation(format!("invalid quantity {s:?}")))?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "K" | "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        other => return Err(Error::validation(format!("unknown quantity suffix {other:?} in {s:?}"))),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::validation(format!("quantity {s:?} is too large")))
}
