//! Admin kubeconfig rendering

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;

use crate::Result;

/// Where and how to write one admin kubeconfig
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigRequest {
    /// Output path
    pub path: PathBuf,
    /// Cluster name used for the cluster, user and context entries
    pub cluster_name: String,
    /// API server host or IP
    pub host: String,
    /// API server port
    pub port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigDoc<'a> {
    api_version: &'a str,
    kind: &'a str,
    current_context: String,
    clusters: Vec<Named<ClusterEntry>>,
    users: Vec<Named<UserEntry>>,
    contexts: Vec<Named<ContextEntry<'a>>>,
    preferences: std::collections::BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    entry: T,
}

#[derive(Serialize)]
struct ClusterEntry {
    cluster: ClusterFields,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterFields {
    server: String,
    certificate_authority_data: String,
}

#[derive(Serialize)]
struct UserEntry {
    user: UserFields,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct UserFields {
    client_certificate_data: String,
    client_key_data: String,
}

#[derive(Serialize)]
struct ContextEntry<'a> {
    context: ContextFields<'a>,
}

#[derive(Serialize)]
struct ContextFields<'a> {
    cluster: &'a str,
    user: &'a str,
}

impl KubeconfigRequest {
    /// A request for `https://host:port`
    pub fn new(
        path: impl Into<PathBuf>,
        cluster_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            path: path.into(),
            cluster_name: cluster_name.into(),
            host: host.into(),
            port,
        }
    }

    /// API server URL
    pub fn server(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }

    /// Render the kubeconfig document
    pub fn render(&self, ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<String> {
        let user = format!("{}-admin", self.cluster_name);
        let context = format!("{}@{}", user, self.cluster_name);
        let doc = KubeconfigDoc {
            api_version: "v1",
            kind: "Config",
            current_context: context.clone(),
            clusters: vec![Named {
                name: self.cluster_name.clone(),
                entry: ClusterEntry {
                    cluster: ClusterFields {
                        server: self.server(),
                        certificate_authority_data: STANDARD.encode(ca_pem),
                    },
                },
            }],
            users: vec![Named {
                name: user.clone(),
                entry: UserEntry {
                    user: UserFields {
                        client_certificate_data: STANDARD.encode(cert_pem),
                        client_key_data: STANDARD.encode(key_pem),
                    },
                },
            }],
            contexts: vec![Named {
                name: context,
                entry: ContextEntry {
                    context: ContextFields {
                        cluster: &self.cluster_name,
                        user: &user,
                    },
                },
            }],
            preferences: Default::default(),
        };
        serde_yaml::to_string(&doc)
            .map_err(|e| crate::PkiError::Parse(format!("failed to render kubeconfig: {}", e)))
    }

    /// Render and write the kubeconfig with owner-only permissions
    pub fn write(&self, ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let text = self.render(ca_pem, cert_pem, key_pem)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&self.path, text.as_bytes())
    }
}

/// Write a file readable only by its owner, replacing any existing file
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_loadable_kubeconfig() {
        let req = KubeconfigRequest::new("/tmp/unused", "demo", "127.0.0.1", 6445);
        let text = req.render("CA", "CERT", "KEY").unwrap();
        let kc: kube::config::Kubeconfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(kc.current_context.as_deref(), Some("demo-admin@demo"));
        let cluster = kc.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://127.0.0.1:6445"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode("CA").as_str())
        );
        assert_eq!(kc.contexts[0].context.as_ref().unwrap().cluster, "demo");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let req = KubeconfigRequest::new("/tmp/unused", "demo", "fd00::1", 6443);
        assert_eq!(req.server(), "https://[fd00::1]:6443");
    }

    #[test]
    fn written_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let req = KubeconfigRequest::new(dir.path().join("nested/kubeconfig"), "demo", "h", 6443);
        req.write("CA", "CERT", "KEY").unwrap();
        let mode = std::fs::metadata(&req.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
