//! Locations of persisted state under `~/.ocne`

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Name of the state directory in the user's home
pub const OCNE_DIR_NAME: &str = ".ocne";
/// Network accounting document
pub const IPS_FILE_NAME: &str = "ips.yaml";
/// Cached converted boot images
pub const IMAGES_DIR_NAME: &str = "images";

/// `~/.ocne`
pub fn ocne_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(OCNE_DIR_NAME))
        .ok_or_else(|| Error::fatal("could not determine the user's home directory"))
}

/// `~/.ocne/ips.yaml`
pub fn ips_file() -> Result<PathBuf> {
    Ok(ocne_dir()?.join(IPS_FILE_NAME))
}

/// Lock file guarding [`ips_file`]
pub fn lock_file_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// `~/.ocne/images`
pub fn images_dir() -> Result<PathBuf> {
    Ok(ocne_dir()?.join(IMAGES_DIR_NAME))
}

/// File name of a cached converted boot image
pub fn cached_image_name(version: &str, arch: &str, provider: &str) -> String {
    format!("boot.qcow2-{version}-{arch}.{provider}")
}

/// Kubeconfig reaching the cluster through the local tunnel
pub fn local_kubeconfig(dir: &Path, cluster: &str) -> PathBuf {
    dir.join(format!("kubeconfig.{cluster}.local"))
}

/// Kubeconfig reaching the cluster on the in-VM address
pub fn vm_kubeconfig(dir: &Path, cluster: &str) -> PathBuf {
    dir.join(format!("kubeconfig.{cluster}.vm"))
}

/// Create a directory and its parents if missing
pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        Error::fatal(format!("failed to create directory {}: {}", dir.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_on_disk_layout() {
        let dir = Path::new("/home/u/.ocne");
        assert_eq!(
            local_kubeconfig(dir, "demo"),
            PathBuf::from("/home/u/.ocne/kubeconfig.demo.local")
        );
        assert_eq!(
            vm_kubeconfig(dir, "demo"),
            PathBuf::from("/home/u/.ocne/kubeconfig.demo.vm")
        );
        assert_eq!(
            lock_file_for(&dir.join(IPS_FILE_NAME)),
            PathBuf::from("/home/u/.ocne/ips.yaml.lock")
        );
        assert_eq!(
            cached_image_name("1.30", "arm64", "oci"),
            "boot.qcow2-1.30-arm64.oci"
        );
    }
}
