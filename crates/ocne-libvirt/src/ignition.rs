//! First-boot configuration for hypervisor nodes
//!
//! Each node boots with an Ignition document carrying its hostname, network
//! keyfiles, the node user, proxy drop-ins and a kubeadm configuration. The
//! first control plane node gets an init configuration plus the cluster CA;
//! every other node gets a join configuration minted against the live cluster.

use std::net::Ipv4Addr;

use base64::Engine;
use minijinja::Environment;
use serde::Serialize;

use ocne_common::config::Proxy;
use ocne_common::{ClusterConfig, Error, Result};

/// Ignition spec version emitted
pub const IGNITION_VERSION: &str = "3.4.0";

/// User created on every node
pub const NODE_USER: &str = "ocne";

/// kubeadm configuration written to the node
pub const KUBEADM_CONFIG_PATH: &str = "/etc/kubernetes/kubeadm.yaml";

/// Unit running kubeadm on first boot
pub const KUBEADM_UNIT: &str = "ocne-kubeadm.service";

const INIT_TEMPLATE: &str = include_str!("../templates/kubeadm-init.yaml.j2");
const JOIN_TEMPLATE: &str = include_str!("../templates/kubeadm-join.yaml.j2");

#[derive(Serialize)]
struct Ignition {
    ignition: Meta,
    #[serde(skip_serializing_if = "Passwd::is_empty")]
    passwd: Passwd,
    storage: Storage,
    systemd: Systemd,
}

#[derive(Serialize)]
struct Meta {
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<ConfigRefs>,
}

#[derive(Serialize)]
struct ConfigRefs {
    merge: Vec<Resource>,
}

#[derive(Serialize)]
struct Resource {
    source: String,
}

impl Resource {
    fn inline(data: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        Self {
            source: format!("data:;base64,{encoded}"),
        }
    }
}

#[derive(Serialize, Default)]
struct Passwd {
    users: Vec<User>,
}

impl Passwd {
    fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct User {
    name: &'static str,
    groups: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password_hash: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
}

#[derive(Serialize, Default)]
struct Storage {
    files: Vec<File>,
}

#[derive(Serialize)]
struct File {
    path: String,
    mode: u32,
    overwrite: bool,
    contents: Resource,
}

impl File {
    fn new(path: impl Into<String>, mode: u32, data: &str) -> Self {
        Self {
            path: path.into(),
            mode,
            overwrite: true,
            contents: Resource::inline(data),
        }
    }
}

#[derive(Serialize, Default)]
struct Systemd {
    units: Vec<Unit>,
}

#[derive(Serialize)]
struct Unit {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contents: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dropins: Vec<Dropin>,
}

#[derive(Serialize)]
struct Dropin {
    name: &'static str,
    contents: String,
}

/// A static IPv4 address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticAddress {
    /// Node address
    pub ip: Ipv4Addr,
    /// Prefix length
    pub prefix: u8,
    /// Default gateway and DNS server
    pub gateway: Ipv4Addr,
}

/// A guest network device and how it is addressed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Predictable device name (`enp1s0`)
    pub device: String,
    /// Static address, DHCP if absent
    pub address: Option<StaticAddress>,
}

impl NetworkInterface {
    /// NetworkManager keyfile for the device
    pub fn keyfile(&self) -> String {
        let ipv4 = match &self.address {
            Some(a) => format!(
                "method=manual\naddress1={}/{},{}\ndns={};\n",
                a.ip, a.prefix, a.gateway, a.gateway
            ),
            None => "method=auto\n".to_string(),
        };
        format!(
            "[connection]\nid={dev}\ntype=ethernet\ninterface-name={dev}\n\n[ipv4]\n{ipv4}\n[ipv6]\nmethod=auto\n",
            dev = self.device
        )
    }
}

/// How a node bootstraps Kubernetes
#[derive(Clone, Debug)]
pub enum Bootstrap {
    /// First control plane node
    Init {
        /// Bootstrap token the other nodes will join with
        token: String,
        /// Cluster CA certificate
        ca_cert_pem: String,
        /// Cluster CA key
        ca_key_pem: String,
        /// Extra API server certificate names
        cert_sans: Vec<String>,
    },
    /// Any other node
    Join {
        /// Bootstrap token minted against the live cluster
        token: String,
        /// CA pin hashes
        ca_cert_hashes: Vec<String>,
        /// Key for the uploaded control plane certificates; control plane joins only
        certificate_key: Option<String>,
    },
}

/// Everything that distinguishes one node's ignition
#[derive(Clone, Debug)]
pub struct NodeIgnition {
    /// Node hostname
    pub hostname: String,
    /// API server endpoint (`host:port`) the cluster is reached on
    pub endpoint: String,
    /// Init or join
    pub bootstrap: Bootstrap,
    /// Guest network devices
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Serialize)]
struct InitValues<'a> {
    token: &'a str,
    bind_port: u16,
    hostname: &'a str,
    untaint: bool,
    cluster_name: &'a str,
    version: String,
    endpoint: &'a str,
    pod_subnet: &'a str,
    service_subnet: &'a str,
    cert_sans: &'a [String],
}

#[derive(Serialize)]
struct JoinValues<'a> {
    endpoint: &'a str,
    token: &'a str,
    ca_cert_hashes: &'a [String],
    hostname: &'a str,
    certificate_key: &'a str,
    bind_port: u16,
}

fn render<S: Serialize>(name: &str, source: &str, ctx: &S) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .map_err(|e| Error::validation(format!("invalid {name} template: {e}")))?;
    env.get_template(name)
        .map_err(|e| Error::validation(format!("{name} template not found: {e}")))?
        .render(ctx)
        .map_err(|e| Error::serialization(format!("failed to render {name} template: {e}")))
}

/// Proxy variables of this process
pub fn proxy_from_env() -> Proxy {
    let var = |upper: &str, lower: &str| {
        std::env::var(upper)
            .or_else(|_| std::env::var(lower))
            .ok()
            .filter(|v| !v.is_empty())
    };
    Proxy {
        http_proxy: var("HTTP_PROXY", "http_proxy"),
        https_proxy: var("HTTPS_PROXY", "https_proxy"),
        no_proxy: var("NO_PROXY", "no_proxy"),
    }
}

fn proxy_dropin(proxy: &Proxy) -> String {
    let mut out = String::from("[Service]\n");
    for (key, value) in [
        ("HTTP_PROXY", &proxy.http_proxy),
        ("HTTPS_PROXY", &proxy.https_proxy),
        ("NO_PROXY", &proxy.no_proxy),
    ] {
        if let Some(v) = value {
            out.push_str(&format!("Environment=\"{key}={v}\"\n"));
        }
    }
    out
}

fn kubeadm_unit(init: bool) -> String {
    let command = if init { "init" } else { "join" };
    format!(
        "[Unit]\n\
         Description=Bootstrap Kubernetes with kubeadm {command}\n\
         Wants=network-online.target crio.service\n\
         After=network-online.target crio.service\n\
         ConditionPathExists=!/etc/kubernetes/kubelet.conf\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=yes\n\
         ExecStart=/usr/bin/kubeadm {command} --config {KUBEADM_CONFIG_PATH}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

fn kube_version(config: &ClusterConfig) -> String {
    if config.kubernetes_version.starts_with('v') {
        config.kubernetes_version.clone()
    } else {
        format!("v{}", config.kubernetes_version)
    }
}

impl NodeIgnition {
    /// kubeadm configuration for this node
    pub fn kubeadm_config(&self, config: &ClusterConfig) -> Result<String> {
        match &self.bootstrap {
            Bootstrap::Init {
                token, cert_sans, ..
            } => render(
                "kubeadm-init",
                INIT_TEMPLATE,
                &InitValues {
                    token,
                    bind_port: config.kube_api_server_bind_port,
                    hostname: &self.hostname,
                    untaint: config.worker_nodes == 0,
                    cluster_name: &config.name,
                    version: kube_version(config),
                    endpoint: &self.endpoint,
                    pod_subnet: &config.pod_subnet,
                    service_subnet: &config.service_subnet,
                    cert_sans,
                },
            ),
            Bootstrap::Join {
                token,
                ca_cert_hashes,
                certificate_key,
            } => render(
                "kubeadm-join",
                JOIN_TEMPLATE,
                &JoinValues {
                    endpoint: &self.endpoint,
                    token,
                    ca_cert_hashes,
                    hostname: &self.hostname,
                    certificate_key: certificate_key.as_deref().unwrap_or_default(),
                    bind_port: config.kube_api_server_bind_port,
                },
            ),
        }
    }

    /// Render the ignition document, folding in `proxy` and any extra ignition
    pub fn render(&self, config: &ClusterConfig, proxy: &Proxy) -> Result<String> {
        let mut files = vec![
            File::new("/etc/hostname", 0o644, &format!("{}\n", self.hostname)),
            File::new(KUBEADM_CONFIG_PATH, 0o600, &self.kubeadm_config(config)?),
        ];
        if let Bootstrap::Init {
            ca_cert_pem,
            ca_key_pem,
            ..
        } = &self.bootstrap
        {
            files.push(File::new("/etc/kubernetes/pki/ca.crt", 0o644, ca_cert_pem));
            files.push(File::new("/etc/kubernetes/pki/ca.key", 0o600, ca_key_pem));
        }
        for iface in &self.interfaces {
            files.push(File::new(
                format!("/etc/NetworkManager/system-connections/{}.nmconnection", iface.device),
                0o600,
                &iface.keyfile(),
            ));
        }

        let init = matches!(self.bootstrap, Bootstrap::Init { .. });
        let mut units = vec![Unit {
            name: KUBEADM_UNIT.to_string(),
            enabled: Some(true),
            contents: Some(kubeadm_unit(init)),
            dropins: Vec::new(),
        }];
        if !proxy.is_empty() {
            for service in ["crio.service", "kubelet.service"] {
                units.push(Unit {
                    name: service.to_string(),
                    enabled: None,
                    contents: None,
                    dropins: vec![Dropin {
                        name: "proxy.conf",
                        contents: proxy_dropin(proxy),
                    }],
                });
            }
        }

        let mut passwd = Passwd::default();
        if config.ssh_public_key.is_some() || config.password.is_some() {
            passwd.users.push(User {
                name: NODE_USER,
                groups: vec!["wheel"],
                password_hash: config.password.clone(),
                ssh_authorized_keys: config.ssh_public_key.iter().cloned().collect(),
            });
        }

        let config_refs = config.extra_ignition()?.map(|extra| ConfigRefs {
            merge: vec![Resource::inline(&extra)],
        });

        let doc = Ignition {
            ignition: Meta {
                version: IGNITION_VERSION,
                config: config_refs,
            },
            passwd,
            storage: Storage { files },
            systemd: Systemd { units },
        };
        Ok(serde_json::to_string(&doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(source: &str) -> String {
        let data = source.strip_prefix("data:;base64,").unwrap();
        String::from_utf8(base64::engine::general_purpose::STANDARD.decode(data).unwrap()).unwrap()
    }

    fn file(doc: &serde_json::Value, path: &str) -> Option<String> {
        doc["storage"]["files"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["path"] == path)
            .map(|f| decode(f["contents"]["source"].as_str().unwrap()))
    }

    fn init_node() -> NodeIgnition {
        NodeIgnition {
            hostname: "demo-control-plane-1".to_string(),
            endpoint: "192.168.122.200:6443".to_string(),
            bootstrap: Bootstrap::Init {
                token: "abcdef.0123456789abcdef".to_string(),
                ca_cert_pem: "CERT".to_string(),
                ca_key_pem: "KEY".to_string(),
                cert_sans: vec!["127.0.0.1".to_string()],
            },
            interfaces: vec![NetworkInterface {
                device: "enp1s0".to_string(),
                address: Some(StaticAddress {
                    ip: "192.168.122.200".parse().unwrap(),
                    prefix: 24,
                    gateway: "192.168.122.1".parse().unwrap(),
                }),
            }],
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            name: "demo".to_string(),
            kubernetes_version: "1.30.3".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn first_node_initialises_with_the_cluster_ca() {
        let json = init_node().render(&config(), &Proxy::default()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["ignition"]["version"], IGNITION_VERSION);
        assert_eq!(file(&doc, "/etc/hostname").unwrap(), "demo-control-plane-1\n");
        assert_eq!(file(&doc, "/etc/kubernetes/pki/ca.key").unwrap(), "KEY");

        let kubeadm = file(&doc, KUBEADM_CONFIG_PATH).unwrap();
        assert!(kubeadm.contains("kind: InitConfiguration"));
        assert!(kubeadm.contains("token: abcdef.0123456789abcdef"));
        assert!(kubeadm.contains("kubernetesVersion: v1.30.3"));
        assert!(kubeadm.contains("controlPlaneEndpoint: 192.168.122.200:6443"));
        assert!(kubeadm.contains("taints: []"));

        let keyfile = file(&doc, "/etc/NetworkManager/system-connections/enp1s0.nmconnection").unwrap();
        assert!(keyfile.contains("address1=192.168.122.200/24,192.168.122.1"));

        assert!(doc.get("passwd").is_none());
        assert_eq!(doc["systemd"]["units"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn control_plane_join_carries_certificate_key() {
        let node = NodeIgnition {
            hostname: "demo-control-plane-2".to_string(),
            endpoint: "192.168.122.200:6443".to_string(),
            bootstrap: Bootstrap::Join {
                token: "abcdef.0123456789abcdef".to_string(),
                ca_cert_hashes: vec!["sha256:aa".to_string()],
                certificate_key: Some("f00d".to_string()),
            },
            interfaces: vec![NetworkInterface {
                device: "enp1s0".to_string(),
                address: None,
            }],
        };
        let kubeadm = node.kubeadm_config(&config()).unwrap();
        assert!(kubeadm.contains("kind: JoinConfiguration"));
        assert!(kubeadm.contains("- sha256:aa"));
        assert!(kubeadm.contains("certificateKey: f00d"));

        let worker = NodeIgnition {
            bootstrap: Bootstrap::Join {
                token: "abcdef.0123456789abcdef".to_string(),
                ca_cert_hashes: vec!["sha256:aa".to_string()],
                certificate_key: None,
            },
            ..node
        };
        let json = worker.render(&config(), &Proxy::default()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(!file(&doc, KUBEADM_CONFIG_PATH).unwrap().contains("controlPlane"));
        assert!(file(&doc, "/etc/kubernetes/pki/ca.key").is_none());
        let keyfile = file(&doc, "/etc/NetworkManager/system-connections/enp1s0.nmconnection").unwrap();
        assert!(keyfile.contains("method=auto"));
    }

    #[test]
    fn user_proxy_and_extra_ignition_are_folded_in() {
        let mut config = config();
        config.ssh_public_key = Some("ssh-ed25519 AAAA dev".to_string());
        config.extra_ignition_inline = Some(r#"{"ignition":{"version":"3.4.0"}}"#.to_string());
        let proxy = Proxy {
            https_proxy: Some("http://proxy:3128".to_string()),
            ..Default::default()
        };

        let json = init_node().render(&config, &proxy).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["passwd"]["users"][0]["name"], NODE_USER);
        assert_eq!(
            doc["passwd"]["users"][0]["sshAuthorizedKeys"][0],
            "ssh-ed25519 AAAA dev"
        );
        assert!(doc["passwd"]["users"][0].get("passwordHash").is_none());

        let units = doc["systemd"]["units"].as_array().unwrap();
        assert_eq!(units.len(), 3);
        let dropin = units[1]["dropins"][0]["contents"].as_str().unwrap();
        assert!(dropin.contains("Environment=\"HTTPS_PROXY=http://proxy:3128\""));
        assert!(!dropin.contains("HTTP_PROXY="));

        let merged = decode(doc["ignition"]["config"]["merge"][0]["source"].as_str().unwrap());
        assert_eq!(merged, r#"{"ignition":{"version":"3.4.0"}}"#);
    }
}
