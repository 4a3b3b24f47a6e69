//! Hypervisor session URIs
//!
//! A configured URI such as `qemu:///session`, `qemu+ssh://user@host/system` or
//! a bare `host/system` is normalised into a [`SessionUri`] that knows which
//! host it reaches and whether that host is this machine.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;

use tracing::debug;
use url::Url;

use ocne_common::{Error, Result};

/// Transport used when a URI names a host without a scheme
pub const DEFAULT_REMOTE_SCHEME: &str = "qemu+ssh";

/// libvirt socket below the user's home on macOS
pub const MACOS_SESSION_SOCKET: &str = ".cache/libvirt/libvirt-sock";

/// A resolved hypervisor connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionUri {
    url: Url,
    host_ip: Option<IpAddr>,
    local: bool,
}

impl SessionUri {
    /// Parse, resolve and classify `raw`
    pub async fn resolve(raw: &str) -> Result<Self> {
        let mut url = parse_session_uri(raw)?;
        if cfg!(target_os = "macos") {
            if let Some(home) = dirs::home_dir() {
                url = with_macos_socket(url, &home);
            }
        }

        let host = url.host_str().unwrap_or_default().to_string();
        if host.is_empty() {
            return Ok(Self {
                url,
                host_ip: None,
                local: true,
            });
        }

        let host_ip = resolve_host(&host).await?;
        let local = host_ip.is_loopback() || local_addresses()?.contains(&host_ip);
        debug!(uri = %url, host = %host, ip = %host_ip, local, "Resolved hypervisor host");
        Ok(Self {
            url,
            host_ip: Some(host_ip),
            local,
        })
    }

    /// A URI whose locality is already known
    pub fn from_parts(url: Url, host_ip: Option<IpAddr>, local: bool) -> Self {
        Self {
            url,
            host_ip,
            local,
        }
    }

    /// The normalised URI
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The URI as passed to `virsh -c`
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// True for per-user session daemons
    pub fn is_session(&self) -> bool {
        self.url.path().trim_end_matches('/') == "/session"
    }

    /// True if the hypervisor runs on this machine
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Key used for the host in network accounting
    pub fn accounting_host(&self) -> String {
        match (&self.host_ip, self.local) {
            (Some(ip), false) => ip.to_string(),
            _ => "localhost".to_string(),
        }
    }

    /// Address this machine reaches the hypervisor host on
    pub fn host_address(&self) -> String {
        match (&self.host_ip, self.local) {
            (Some(ip), false) => ip.to_string(),
            _ => "127.0.0.1".to_string(),
        }
    }
}

impl std::fmt::Display for SessionUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}

/// Parse a configured URI, rewriting scheme-less host paths to SSH transport
pub fn parse_session_uri(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::validation_for_field("sessionUri", "session URI is empty"));
    }

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        let rest = if raw.contains('/') {
            raw.to_string()
        } else {
            format!("{raw}/system")
        };
        format!("{DEFAULT_REMOTE_SCHEME}://{rest}")
    };

    Url::parse(&candidate)
        .map_err(|e| Error::validation_for_field("sessionUri", format!("invalid URI {raw}: {e}")))
}

/// Point a local session URI at the per-user socket below `home`
pub fn with_macos_socket(mut url: Url, home: &Path) -> Url {
    let local = url.host_str().is_none_or(str::is_empty);
    let session = url.path().trim_end_matches('/') == "/session";
    let has_socket = url.query_pairs().any(|(k, _)| k == "socket");
    if local && session && !has_socket {
        let socket = home.join(MACOS_SESSION_SOCKET);
        url.query_pairs_mut()
            .append_pair("socket", &socket.to_string_lossy());
    }
    url
}

async fn resolve_host(host: &str) -> Result<IpAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| Error::validation(format!("failed to resolve hypervisor host {host}: {e}")))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| Error::not_found("host address", host))
}

/// Addresses bound to this machine's interfaces
pub fn local_addresses() -> Result<BTreeSet<IpAddr>> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::fatal(format!("failed to list interface addresses: {e}")))?;
    Ok(addrs
        .filter_map(|ifa| ifa.address)
        .filter_map(|addr| {
            if let Some(v4) = addr.as_sockaddr_in() {
                Some(IpAddr::V4(v4.ip()))
            } else {
                addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_paths_use_ssh() {
        assert_eq!(
            parse_session_uri("build-host/system").unwrap().as_str(),
            "qemu+ssh://build-host/system"
        );
        assert_eq!(
            parse_session_uri("build-host").unwrap().as_str(),
            "qemu+ssh://build-host/system"
        );
        assert_eq!(
            parse_session_uri("qemu:///session").unwrap().as_str(),
            "qemu:///session"
        );
        assert!(parse_session_uri("  ").is_err());
    }

    #[test]
    fn explicit_user_is_kept() {
        let url = parse_session_uri("qemu+ssh://opc@10.0.0.5/system").unwrap();
        assert_eq!(url.username(), "opc");
        assert_eq!(url.host_str(), Some("10.0.0.5"));
    }

    #[test]
    fn macos_session_gets_a_socket() {
        let url = parse_session_uri("qemu:///session").unwrap();
        let url = with_macos_socket(url, Path::new("/Users/dev"));
        assert_eq!(
            url.as_str(),
            "qemu:///session?socket=%2FUsers%2Fdev%2F.cache%2Flibvirt%2Flibvirt-sock"
        );

        let system = parse_session_uri("qemu:///system").unwrap();
        assert_eq!(
            with_macos_socket(system, Path::new("/Users/dev")).as_str(),
            "qemu:///system"
        );
    }

    #[tokio::test]
    async fn hostless_uris_are_local() {
        let uri = SessionUri::resolve("qemu:///system").await.unwrap();
        assert!(uri.is_local());
        assert!(!uri.is_session());
        assert_eq!(uri.accounting_host(), "localhost");
        assert_eq!(uri.host_address(), "127.0.0.1");
    }

    #[tokio::test]
    async fn loopback_hosts_are_local() {
        let uri = SessionUri::resolve("qemu+ssh://127.0.0.1/session").await.unwrap();
        assert!(uri.is_local());
        assert!(uri.is_session());
    }

    #[test]
    fn remote_hosts_are_keyed_by_address() {
        let url = parse_session_uri("qemu+ssh://10.0.0.5/system").unwrap();
        let uri = SessionUri::from_parts(url, Some("10.0.0.5".parse().unwrap()), false);
        assert_eq!(uri.accounting_host(), "10.0.0.5");
        assert_eq!(uri.host_address(), "10.0.0.5");
    }
}
