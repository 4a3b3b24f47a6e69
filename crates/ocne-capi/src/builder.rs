//! Node image builder
//!
//! Ensures a platform image exists for a (kubernetes version, architecture)
//! pair. Missing images are built from the boot disk container image: the
//! qcow2 is extracted, converted for the platform by a privileged job on a
//! cluster node, cached under `~/.ocne/images`, uploaded to object storage and
//! imported. The import finishes asynchronously; callers wait on the returned
//! work request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use ocne_common::config::boot_image_for_version;
use ocne_common::image::ImageInspector;
use ocne_common::kube_utils::node_is_ready;
use ocne_common::paths::cached_image_name;
use ocne_common::script::{run_node_script, NodeScript};
use ocne_common::{Error, KubeVersion, Result, OCNE_SYSTEM_NAMESPACE};

use crate::oci::{find_newest_image, ImageImport, OciClient};

/// Provider suffix of cached converted images
pub const PROVIDER_SUFFIX: &str = "oci";

/// Largest chunk stored in one ConfigMap
const CONFIG_MAP_CHUNK: usize = 900 * 1024;

/// Tag of the boot disk container image for a kubernetes version
///
/// Boot images are published per minor release.
pub fn boot_image_tag(version: &str) -> String {
    KubeVersion::parse(version)
        .map(|v| v.minor_string())
        .unwrap_or_else(|_| version.to_string())
}

/// A platform image, and the import still running for it if it is new
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltImage {
    /// Image OCID
    pub image_id: String,
    /// Work request of a running import, if one was started
    pub work_request_id: Option<String>,
}

/// Something that can produce a platform image for a version and architecture
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Find or build the image; `force` rebuilds even if one exists
    async fn ensure_image(
        &self,
        display_name: &str,
        arch: &str,
        version: &str,
        force: bool,
    ) -> Result<BuiltImage>;
}

/// Converts a raw boot disk into one bootable on the platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Convert `source` into `dest`
    async fn convert(&self, source: &Path, dest: &Path, arch: &str) -> Result<()>;
}

/// [`ImageProvider`] that builds and imports images
pub struct ImageBuilder {
    oci: Arc<dyn OciClient>,
    inspector: Arc<dyn ImageInspector>,
    converter: Arc<dyn ImageConverter>,
    compartment: String,
    bucket: String,
    boot_image: String,
    images_dir: PathBuf,
}

impl ImageBuilder {
    /// A builder importing into `compartment` through `bucket`
    pub fn new(
        oci: Arc<dyn OciClient>,
        inspector: Arc<dyn ImageInspector>,
        converter: Arc<dyn ImageConverter>,
        compartment: impl Into<String>,
        bucket: impl Into<String>,
        boot_image: impl Into<String>,
        images_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            oci,
            inspector,
            converter,
            compartment: compartment.into(),
            bucket: bucket.into(),
            boot_image: boot_image.into(),
            images_dir: images_dir.into(),
        }
    }

    /// Converted image for (version, arch), building it if not cached
    async fn converted_image(&self, version: &str, arch: &str, force: bool) -> Result<PathBuf> {
        let cached = self
            .images_dir
            .join(cached_image_name(version, arch, PROVIDER_SUFFIX));
        if force && cached.exists() {
            std::fs::remove_file(&cached)?;
        }
        if cached.exists() {
            info!(path = %cached.display(), "Using cached converted image");
            return Ok(cached);
        }

        std::fs::create_dir_all(&self.images_dir)?;
        let raw = self
            .images_dir
            .join(format!("boot.qcow2-{version}-{arch}"));
        let source = boot_image_for_version(&self.boot_image, &boot_image_tag(version));
        self.inspector
            .extract_boot_disk(&source, arch, &raw)
            .await?;
        let converted = self.converter.convert(&raw, &cached, arch).await;
        if let Err(e) = std::fs::remove_file(&raw) {
            warn!(path = %raw.display(), error = %e, "Failed to remove raw boot disk");
        }
        converted?;
        Ok(cached)
    }
}

#[async_trait]
impl ImageProvider for ImageBuilder {
    async fn ensure_image(
        &self,
        display_name: &str,
        arch: &str,
        version: &str,
        force: bool,
    ) -> Result<BuiltImage> {
        if !force {
            if let Some(existing) =
                find_newest_image(self.oci.as_ref(), &self.compartment, display_name, version, arch)
                    .await?
            {
                info!(image = %existing.id, version, arch, "Image already exists");
                return Ok(BuiltImage {
                    image_id: existing.id,
                    work_request_id: None,
                });
            }
        }

        let path = self.converted_image(version, arch, force).await?;
        let object_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::validation(format!("bad image path {}", path.display())))?;

        let namespace = self.oci.object_storage_namespace().await?;
        self.oci
            .ensure_bucket(&self.compartment, &namespace, &self.bucket)
            .await?;
        self.oci
            .upload_object(&namespace, &self.bucket, &object_name, &path)
            .await?;

        let (image_id, work_request_id) = self
            .oci
            .import_image(&ImageImport {
                compartment: self.compartment.clone(),
                display_name: display_name.to_string(),
                namespace,
                bucket: self.bucket.clone(),
                object_name,
                kubernetes_version: version.to_string(),
                architecture: arch.to_string(),
            })
            .await?;
        info!(image = %image_id, work_request = %work_request_id, version, arch, "Importing image");
        Ok(BuiltImage {
            image_id,
            work_request_id: Some(work_request_id),
        })
    }
}

/// [`ImageConverter`] that runs the conversion in a privileged pod
///
/// The source disk is shipped to the pod in ConfigMap chunks and the converted
/// disk comes back base64-encoded on the pod's log stream.
pub struct PodImageConverter {
    client: Client,
    namespace: String,
}

/// Conversion job: reassemble the disk, rewrite partition UUIDs and kernel
/// arguments for the platform, emit the result
pub const CONVERT_SCRIPT: &str = r#"set -e
work=$(mktemp -d)
trap 'rm -rf "$work"' EXIT
for chunk in $(ls -d /in/* | sort); do
  cat "$chunk/data" >> "$work/boot.qcow2"
done
ocne-image-convert --platform oci --arch "$ARCH" "$work/boot.qcow2" >&2
base64 -w0 "$work/boot.qcow2"
"#;

impl PodImageConverter {
    /// Convert on any ready node of the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: OCNE_SYSTEM_NAMESPACE.to_string(),
        }
    }

    async fn pick_node(&self) -> Result<String> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .find(|n| node_is_ready(n))
            .and_then(|n| n.metadata.name.clone())
            .ok_or_else(|| Error::precondition("image conversion", "no ready node to run on"))
    }
}

/// Split a disk into ConfigMaps named `<prefix>-<n>`
pub fn chunk_config_maps(prefix: &str, namespace: &str, data: &[u8]) -> Vec<ConfigMap> {
    data.chunks(CONFIG_MAP_CHUNK)
        .enumerate()
        .map(|(i, chunk)| ConfigMap {
            metadata: ObjectMeta {
                name: Some(format!("{prefix}-{i:04}")),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            binary_data: Some(BTreeMap::from([(
                "data".to_string(),
                ByteString(chunk.to_vec()),
            )])),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl ImageConverter for PodImageConverter {
    async fn convert(&self, source: &Path, dest: &Path, arch: &str) -> Result<()> {
        let node = self.pick_node().await?;
        let prefix = format!("ocne-image-{arch}");
        let data = tokio::fs::read(source).await?;
        let chunks = chunk_config_maps(&prefix, &self.namespace, &data);
        let cms: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);

        let mut script = NodeScript::new(node, &self.namespace, format!("{prefix}-convert"), CONVERT_SCRIPT)
            .without_chroot()
            .with_env("ARCH", arch);
        let mut names = Vec::with_capacity(chunks.len());
        for cm in &chunks {
            let name = cm.metadata.name.clone().unwrap_or_default();
            if let Err(e) = cms.delete(&name, &DeleteParams::default()).await.map_err(Error::from) {
                if !e.is_not_found() {
                    warn!(config_map = %name, error = %e, "Failed to delete stale image chunk");
                }
            }
            cms.create(&PostParams::default(), cm).await?;
            script = script.with_config_map(&name, format!("/in/{name}"));
            names.push(name);
        }

        info!(arch, chunks = names.len(), "Converting boot image");
        let result = run_node_script(&self.client, &script).await;
        for name in &names {
            if let Err(e) = cms.delete(name, &DeleteParams::default()).await {
                warn!(config_map = %name, error = %e, "Failed to delete image chunk");
            }
        }
        let output = result?;

        let encoded = output.logs.lines().last().unwrap_or_default().trim();
        let converted = STANDARD
            .decode(encoded)
            .map_err(|e| Error::command("image conversion", format!("bad output: {e}")))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, converted).await?;
        info!(path = %dest.display(), "Converted boot image");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use chrono::{DateTime, Utc};

    use super::*;

    mockall::mock! {
        pub ImageInspector {}

        #[async_trait]
        impl ImageInspector for ImageInspector {
            async fn created(&self, image: &str, arch: &str) -> Result<DateTime<Utc>>;
            async fn extract_boot_disk(&self, image: &str, arch: &str, dest: &Path) -> Result<()>;
        }
    }
}
