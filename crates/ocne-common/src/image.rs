//! Boot disk container images
//!
//! Node boot disks ship as container images whose first layer carries
//! `disk/boot.qcow2`. Registry access goes through `skopeo`; the layer itself is
//! unpacked here with `tar` and `flate2`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::command::Cmd;
use crate::{Error, Result};

/// Path of the boot disk inside the image's first layer
pub const BOOT_DISK_PATH: &str = "disk/boot.qcow2";

const SKOPEO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Inspects and unpacks boot disk container images
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageInspector: Send + Sync {
    /// Build timestamp of the image for `arch`
    async fn created(&self, image: &str, arch: &str) -> Result<DateTime<Utc>>;

    /// Extract the boot disk of the image for `arch` to `dest`
    async fn extract_boot_disk(&self, image: &str, arch: &str, dest: &Path) -> Result<()>;
}

/// [`ImageInspector`] backed by `skopeo`
#[derive(Clone, Debug, Default)]
pub struct SkopeoInspector;

#[derive(Deserialize)]
struct InspectOutput {
    #[serde(rename = "Created")]
    created: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciManifest {
    layers: Vec<OciDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciDescriptor {
    digest: String,
}

fn transport(image: &str) -> String {
    if image.contains("://") {
        image.to_string()
    } else {
        format!("docker://{image}")
    }
}

#[async_trait]
impl ImageInspector for SkopeoInspector {
    async fn created(&self, image: &str, arch: &str) -> Result<DateTime<Utc>> {
        let out: InspectOutput = Cmd::new("skopeo")
            .args(["inspect", "--override-arch", arch, "--override-os", "linux"])
            .arg(transport(image))
            .json()
            .await?;
        debug!(image, created = %out.created, "Inspected image");
        Ok(out.created)
    }

    async fn extract_boot_disk(&self, image: &str, arch: &str, dest: &Path) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let layout = staging.path().join("image");
        info!(image, arch, "Pulling boot image");
        Cmd::new("skopeo")
            .args(["copy", "--override-arch", arch, "--override-os", "linux"])
            .arg(transport(image))
            .arg(format!("dir:{}", layout.display()))
            .timeout(SKOPEO_TIMEOUT)
            .output()
            .await?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_from_layout(&layout, &dest))
            .await
            .map_err(|e| Error::fatal(format!("boot disk extraction task failed: {e}")))?
    }
}

/// Path of the first layer blob in a `skopeo copy dir:` layout
pub fn first_layer_path(layout: &Path) -> Result<PathBuf> {
    let data = std::fs::read(layout.join("manifest.json"))?;
    let manifest: OciManifest = serde_json::from_slice(&data)?;
    let first = manifest
        .layers
        .first()
        .ok_or_else(|| Error::validation("image has no layers"))?;
    let blob = first
        .digest
        .split_once(':')
        .map(|(_, hex)| hex)
        .unwrap_or(&first.digest);
    Ok(layout.join(blob))
}

/// Unpack [`BOOT_DISK_PATH`] from a layer blob, gzip-compressed or not
pub fn extract_boot_disk_from_layer(layer: &Path, dest: &Path) -> Result<()> {
    let mut file = BufReader::new(File::open(layer)?);
    let mut magic = [0u8; 2];
    let gzip = {
        let n = file.get_mut().read(&mut magic)?;
        n == 2 && magic == [0x1f, 0x8b]
    };
    let file = File::open(layer)?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let normalized = path.strip_prefix("./").unwrap_or(&path);
        if normalized == Path::new(BOOT_DISK_PATH) {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(dest)?;
            return Ok(());
        }
    }
    Err(Error::not_found("boot disk", BOOT_DISK_PATH))
}

fn extract_from_layout(layout: &Path, dest: &Path) -> Result<()> {
    let layer = first_layer_path(layout)?;
    extract_boot_disk_from_layer(&layer, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn layer_with(entries: &[(&str, &[u8])], gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let raw = builder.into_inner().unwrap();
        if !gzip {
            return raw;
        }
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        std::io::Write::write_all(&mut enc, &raw).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn extracts_boot_disk_from_gzip_layer() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("abc");
        std::fs::write(
            &layer,
            layer_with(&[("etc/os-release", b"x"), ("disk/boot.qcow2", b"QFI")], true),
        )
        .unwrap();
        let dest = dir.path().join("out/boot.qcow2");
        extract_boot_disk_from_layer(&layer, &dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"QFI");
    }

    #[test]
    fn extracts_from_plain_tar_with_dot_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("abc");
        std::fs::write(&layer, layer_with(&[("./disk/boot.qcow2", b"QFI")], false)).unwrap();
        let dest = dir.path().join("boot.qcow2");
        extract_boot_disk_from_layer(&layer, &dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"QFI");
    }

    #[test]
    fn missing_boot_disk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("abc");
        std::fs::write(&layer, layer_with(&[("etc/os-release", b"x")], true)).unwrap();
        let err = extract_boot_disk_from_layer(&layer, &dir.path().join("b")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn first_layer_comes_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{"schemaVersion":2,"layers":[{"digest":"sha256:aaa"},{"digest":"sha256:bbb"}]}"#,
        )
        .unwrap();
        assert_eq!(first_layer_path(dir.path()).unwrap(), dir.path().join("aaa"));
    }

    #[test]
    fn bare_references_get_docker_transport() {
        assert_eq!(transport("reg/ock:1.30"), "docker://reg/ock:1.30");
        assert_eq!(transport("docker://reg/ock:1.30"), "docker://reg/ock:1.30");
    }
}
