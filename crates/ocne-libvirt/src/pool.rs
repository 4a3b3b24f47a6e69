//! Storage pool discovery

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use ocne_common::Result;

use crate::hypervisor::Hypervisor;
use crate::uri::SessionUri;
use crate::xml::{PoolInfo, PoolSpec};

/// Directory of the system image pool
pub const DEFAULT_POOL_PATH: &str = "/var/lib/libvirt/images";

/// Image pool directory below the user's home for macOS sessions
pub const USER_POOL_DIR: &str = ".local/share/libvirt/images";

/// Where a new pool is created
pub fn default_pool_path(uri: &SessionUri, macos: bool, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) if macos && uri.is_session() && uri.is_local() => home.join(USER_POOL_DIR),
        _ => PathBuf::from(DEFAULT_POOL_PATH),
    }
}

/// Find the pool to store volumes in, creating it if nothing matches
///
/// The configured name wins. Failing that, any active pool whose target is
/// `path` is reused. Otherwise a directory pool named `name` is created at
/// `path`. The chosen pool is refreshed before it is returned.
pub async fn ensure_pool(hv: &dyn Hypervisor, name: &str, path: &Path) -> Result<String> {
    let pool = if let Some(found) = find_pool(hv, name, path).await? {
        found
    } else {
        let spec = PoolSpec {
            name: name.to_string(),
            path: path.to_string_lossy().to_string(),
        };
        hv.create_pool(name, &spec.to_xml()?).await?;
        info!(pool = name, path = %path.display(), "Created storage pool");
        name.to_string()
    };

    hv.refresh_pool(&pool).await?;
    Ok(pool)
}

/// The pool named `name`, or an active pool whose target is `path`
pub async fn find_pool(hv: &dyn Hypervisor, name: &str, path: &Path) -> Result<Option<String>> {
    if hv.list_pools().await?.iter().any(|p| p == name) {
        debug!(pool = name, "Using configured storage pool");
        return Ok(Some(name.to_string()));
    }
    let found = find_pool_by_path(hv, path).await?;
    if let Some(found) = &found {
        info!(pool = %found, path = %path.display(), "Using existing storage pool");
    }
    Ok(found)
}

async fn find_pool_by_path(hv: &dyn Hypervisor, path: &Path) -> Result<Option<String>> {
    for pool in hv.list_active_pools().await? {
        let info = match hv.pool_xml(&pool).await.and_then(|xml| PoolInfo::from_xml(&xml)) {
            Ok(info) => info,
            Err(e) => {
                warn!(pool = %pool, error = %e, "Skipping unreadable storage pool");
                continue;
            }
        };
        if info.path.as_deref() == Some(path) {
            return Ok(Some(info.name));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MockHypervisor;
    use crate::uri::parse_session_uri;

    fn pool_xml(name: &str, path: &str) -> String {
        format!("<pool type='dir'><name>{name}</name><target><path>{path}</path></target></pool>")
    }

    #[tokio::test]
    async fn configured_pool_is_used() {
        let mut hv = MockHypervisor::new();
        hv.expect_list_pools()
            .returning(|| Ok(vec!["default".to_string(), "images".to_string()]));
        hv.expect_list_active_pools().never();
        hv.expect_create_pool().never();
        hv.expect_refresh_pool()
            .withf(|name| name == "images")
            .times(1)
            .returning(|_| Ok(()));

        let pool = ensure_pool(&hv, "images", Path::new(DEFAULT_POOL_PATH)).await.unwrap();
        assert_eq!(pool, "images");
    }

    #[tokio::test]
    async fn pool_is_matched_by_target_path() {
        let mut hv = MockHypervisor::new();
        hv.expect_list_pools().returning(|| Ok(vec!["default".to_string()]));
        hv.expect_list_active_pools()
            .returning(|| Ok(vec!["scratch".to_string(), "default".to_string()]));
        hv.expect_pool_xml().returning(|name| {
            Ok(match name {
                "scratch" => pool_xml("scratch", "/tmp/scratch"),
                _ => pool_xml("default", DEFAULT_POOL_PATH),
            })
        });
        hv.expect_create_pool().never();
        hv.expect_refresh_pool()
            .withf(|name| name == "default")
            .returning(|_| Ok(()));

        let pool = ensure_pool(&hv, "images", Path::new(DEFAULT_POOL_PATH)).await.unwrap();
        assert_eq!(pool, "default");
    }

    #[tokio::test]
    async fn missing_pool_is_created() {
        let mut hv = MockHypervisor::new();
        hv.expect_list_pools().returning(|| Ok(vec![]));
        hv.expect_list_active_pools().returning(|| Ok(vec![]));
        hv.expect_create_pool()
            .withf(|name, xml| name == "images" && xml.contains("<path>/srv/pool</path>"))
            .times(1)
            .returning(|_, _| Ok(()));
        hv.expect_refresh_pool().returning(|_| Ok(()));

        let pool = ensure_pool(&hv, "images", Path::new("/srv/pool")).await.unwrap();
        assert_eq!(pool, "images");
    }

    #[test]
    fn macos_sessions_use_the_home_directory() {
        let session = SessionUri::from_parts(parse_session_uri("qemu:///session").unwrap(), None, true);
        let system = SessionUri::from_parts(parse_session_uri("qemu:///system").unwrap(), None, true);
        let home = Path::new("/Users/dev");

        assert_eq!(
            default_pool_path(&session, true, Some(home)),
            PathBuf::from("/Users/dev/.local/share/libvirt/images")
        );
        assert_eq!(
            default_pool_path(&session, false, Some(home)),
            PathBuf::from(DEFAULT_POOL_PATH)
        );
        assert_eq!(
            default_pool_path(&system, true, Some(home)),
            PathBuf::from(DEFAULT_POOL_PATH)
        );
    }
}
