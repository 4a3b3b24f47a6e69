//! OCI platform client
//!
//! Provides a trait-based abstraction over the compute image, object storage
//! and work request APIs, with a production implementation that drives the
//! `oci` command line tool.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use ocne_common::command::Cmd;
use ocne_common::version::KubeVersion;
use ocne_common::{Error, Result, TAG_ARCHITECTURE, TAG_KUBERNETES};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A custom image registered with the compute service
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformImage {
    /// Image OCID
    pub id: String,
    /// Display name
    pub display_name: String,
    /// Compartment OCID
    pub compartment_id: String,
    /// Creation time
    pub time_created: DateTime<Utc>,
    /// Free-form tags, including the kubernetes version and architecture
    #[serde(default)]
    pub freeform_tags: BTreeMap<String, String>,
    /// Lifecycle state, e.g. AVAILABLE or IMPORTING
    #[serde(default)]
    pub lifecycle_state: String,
}

impl PlatformImage {
    /// The kubernetes version the image was built for
    pub fn kubernetes_version(&self) -> Result<&str> {
        self.freeform_tags
            .get(TAG_KUBERNETES)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::validation(format!(
                    "image {} has no {} tag",
                    self.id, TAG_KUBERNETES
                ))
            })
    }

    /// Architecture tag, if any
    pub fn architecture(&self) -> Option<&str> {
        self.freeform_tags.get(TAG_ARCHITECTURE).map(String::as_str)
    }
}

/// True if an image version tag names the same release as `target`
///
/// Versions compare by minor; patch levels only matter when both carry one.
pub fn versions_match(tag: &str, target: &str) -> bool {
    match (KubeVersion::parse(tag), KubeVersion::parse(target)) {
        (Ok(a), Ok(b)) => {
            a.same_minor(&b)
                && match (a.patch, b.patch) {
                    (Some(x), Some(y)) => x == y,
                    _ => true,
                }
        }
        _ => tag == target,
    }
}

/// Status of an asynchronous platform operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkRequestStatus {
    /// Queued
    Accepted,
    /// Running
    InProgress,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Being canceled
    Canceling,
    /// Canceled
    Canceled,
}

impl WorkRequestStatus {
    /// True once the request can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// True for terminal states other than success
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for WorkRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A work request snapshot
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkRequest {
    /// Work request OCID
    pub id: String,
    /// Current status
    pub status: WorkRequestStatus,
    /// Percent complete
    #[serde(default)]
    pub percent_complete: f32,
}

/// Parameters for importing an image from object storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageImport {
    /// Target compartment
    pub compartment: String,
    /// Display name of the new image
    pub display_name: String,
    /// Object storage namespace
    pub namespace: String,
    /// Bucket holding the object
    pub bucket: String,
    /// Object name
    pub object_name: String,
    /// Kubernetes version tag
    pub kubernetes_version: String,
    /// Architecture tag
    pub architecture: String,
}

impl ImageImport {
    /// Free-form tags applied to the imported image
    pub fn freeform_tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TAG_KUBERNETES.to_string(), self.kubernetes_version.clone()),
            (TAG_ARCHITECTURE.to_string(), self.architecture.clone()),
        ])
    }
}

/// Compute, object storage and work request operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OciClient: Send + Sync {
    /// Images in a compartment with a given display name
    async fn list_images(&self, compartment: &str, display_name: &str)
        -> Result<Vec<PlatformImage>>;

    /// One image by id
    async fn get_image(&self, image_id: &str) -> Result<PlatformImage>;

    /// Object storage namespace of the tenancy
    async fn object_storage_namespace(&self) -> Result<String>;

    /// Create a bucket unless it exists
    async fn ensure_bucket(&self, compartment: &str, namespace: &str, bucket: &str) -> Result<()>;

    /// Upload a file as an object, replacing any existing object
    async fn upload_object(
        &self,
        namespace: &str,
        bucket: &str,
        object_name: &str,
        path: &Path,
    ) -> Result<()>;

    /// Start an image import; returns (image id, work request id)
    async fn import_image(&self, import: &ImageImport) -> Result<(String, String)>;

    /// Current state of a work request
    async fn get_work_request(&self, id: &str) -> Result<WorkRequest>;

    /// Attach a capability schema to an image
    async fn create_capability_schema(
        &self,
        compartment: &str,
        image_id: &str,
        schema: &serde_json::Value,
    ) -> Result<()>;

    /// Shapes an image is marked compatible with
    async fn list_shape_compatibilities(&self, image_id: &str) -> Result<Vec<String>>;

    /// Mark an image compatible with a shape
    async fn add_shape_compatibility(&self, image_id: &str, shape: &str) -> Result<()>;

    /// Remove a shape compatibility entry
    async fn remove_shape_compatibility(&self, image_id: &str, shape: &str) -> Result<()>;
}

/// Newest image named `display_name` for (`version`, `arch`) in `compartment`
///
/// Images without a kubernetes version tag are rejected.
pub async fn find_newest_image(
    oci: &dyn OciClient,
    compartment: &str,
    display_name: &str,
    version: &str,
    arch: &str,
) -> Result<Option<PlatformImage>> {
    let mut newest: Option<PlatformImage> = None;
    for image in oci.list_images(compartment, display_name).await? {
        if image.compartment_id != compartment || image.display_name != display_name {
            continue;
        }
        if !versions_match(image.kubernetes_version()?, version) {
            continue;
        }
        if image.architecture() != Some(arch) {
            continue;
        }
        if newest
            .as_ref()
            .is_none_or(|n| image.time_created > n.time_created)
        {
            newest = Some(image);
        }
    }
    Ok(newest)
}

/// [`OciClient`] that shells out to the `oci` CLI
#[derive(Clone, Debug)]
pub struct OciCli {
    profile: String,
    region: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(rename = "opc-work-request-id", default)]
    work_request_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ShapeEntry {
    shape: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GlobalSchema {
    current_version_name: String,
}

impl OciCli {
    /// A client for a CLI profile and optional region override
    pub fn new(profile: impl Into<String>, region: Option<String>) -> Self {
        Self {
            profile: profile.into(),
            region: region.filter(|r| !r.is_empty()),
        }
    }

    fn cmd(&self) -> Cmd {
        let cmd = Cmd::new("oci").args(["--profile", &self.profile]);
        match &self.region {
            Some(r) => cmd.args(["--region", r]),
            None => cmd,
        }
    }
}

#[async_trait]
impl OciClient for OciCli {
    async fn list_images(
        &self,
        compartment: &str,
        display_name: &str,
    ) -> Result<Vec<PlatformImage>> {
        let out = self
            .cmd()
            .args(["compute", "image", "list", "--all"])
            .args(["--compartment-id", compartment, "--display-name", display_name])
            .output()
            .await?;
        // an empty result prints nothing
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        let env: Envelope<Vec<PlatformImage>> = serde_json::from_str(&out)?;
        Ok(env.data)
    }

    async fn get_image(&self, image_id: &str) -> Result<PlatformImage> {
        let env: Envelope<PlatformImage> = self
            .cmd()
            .args(["compute", "image", "get", "--image-id", image_id])
            .json()
            .await?;
        Ok(env.data)
    }

    async fn object_storage_namespace(&self) -> Result<String> {
        let env: Envelope<String> = self.cmd().args(["os", "ns", "get"]).json().await?;
        Ok(env.data)
    }

    async fn ensure_bucket(&self, compartment: &str, namespace: &str, bucket: &str) -> Result<()> {
        let exists = self
            .cmd()
            .args(["os", "bucket", "get", "--namespace", namespace, "--bucket-name", bucket])
            .output()
            .await
            .is_ok();
        if exists {
            return Ok(());
        }
        self.cmd()
            .args(["os", "bucket", "create", "--namespace", namespace])
            .args(["--compartment-id", compartment, "--name", bucket])
            .output()
            .await?;
        info!(bucket, "Created object storage bucket");
        Ok(())
    }

    async fn upload_object(
        &self,
        namespace: &str,
        bucket: &str,
        object_name: &str,
        path: &Path,
    ) -> Result<()> {
        info!(bucket, object = object_name, "Uploading image");
        self.cmd()
            .args(["os", "object", "put", "--force", "--namespace", namespace])
            .args(["--bucket-name", bucket, "--name", object_name, "--file"])
            .arg(path)
            .timeout(UPLOAD_TIMEOUT)
            .output()
            .await?;
        Ok(())
    }

    async fn import_image(&self, import: &ImageImport) -> Result<(String, String)> {
        let tags = serde_json::to_string(&import.freeform_tags())?;
        let env: Envelope<PlatformImage> = self
            .cmd()
            .args(["compute", "image", "import", "from-object"])
            .args(["--compartment-id", &import.compartment])
            .args(["--display-name", &import.display_name])
            .args(["--namespace", &import.namespace, "--bucket-name", &import.bucket])
            .args(["--name", &import.object_name])
            .args(["--source-image-type", "QCOW2", "--launch-mode", "PARAVIRTUALIZED"])
            .args(["--operating-system", "Oracle Linux"])
            .args(["--freeform-tags", &tags])
            .json()
            .await?;
        let wr = env.work_request_id.ok_or_else(|| {
            Error::command("oci compute image import", "no work request id returned")
        })?;
        debug!(image = %env.data.id, work_request = %wr, "Started image import");
        Ok((env.data.id, wr))
    }

    async fn get_work_request(&self, id: &str) -> Result<WorkRequest> {
        let env: Envelope<WorkRequest> = self
            .cmd()
            .args(["work-requests", "work-request", "get", "--work-request-id", id])
            .json()
            .await?;
        Ok(env.data)
    }

    async fn create_capability_schema(
        &self,
        compartment: &str,
        image_id: &str,
        schema: &serde_json::Value,
    ) -> Result<()> {
        let globals: Envelope<Vec<GlobalSchema>> = self
            .cmd()
            .args(["compute", "global-image-capability-schema", "list", "--all"])
            .json()
            .await?;
        let version = globals
            .data
            .first()
            .map(|g| g.current_version_name.clone())
            .ok_or_else(|| Error::not_found("global image capability schema", "current"))?;
        self.cmd()
            .args(["compute", "image-capability-schema", "create"])
            .args(["--compartment-id", compartment, "--image-id", image_id])
            .args(["--global-image-capability-schema-version-name", &version])
            .args(["--schema-data", &schema.to_string()])
            .output()
            .await?;
        Ok(())
    }

    async fn list_shape_compatibilities(&self, image_id: &str) -> Result<Vec<String>> {
        let out = self
            .cmd()
            .args(["compute", "image-shape-compatibility-entry", "list", "--all"])
            .args(["--image-id", image_id])
            .output()
            .await?;
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        let env: Envelope<Vec<ShapeEntry>> = serde_json::from_str(&out)?;
        Ok(env.data.into_iter().map(|e| e.shape).collect())
    }

    async fn add_shape_compatibility(&self, image_id: &str, shape: &str) -> Result<()> {
        self.cmd()
            .args(["compute", "image-shape-compatibility-entry", "add"])
            .args(["--image-id", image_id, "--shape-name", shape])
            .output()
            .await?;
        Ok(())
    }

    async fn remove_shape_compatibility(&self, image_id: &str, shape: &str) -> Result<()> {
        self.cmd()
            .args(["compute", "image-shape-compatibility-entry", "remove", "--force"])
            .args(["--image-id", image_id, "--shape-name", shape])
            .output()
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::image;
    use super::*;

    #[test]
    fn parses_cli_image_list() {
        let out = r#"{"data": [{
            "id": "ocid1.image.a",
            "display-name": "ock",
            "compartment-id": "ocid1.compartment.c",
            "time-created": "2024-05-01T10:00:00.000000+00:00",
            "freeform-tags": {"ocne/kubernetes": "1.30", "ocne/architecture": "amd64"},
            "lifecycle-state": "AVAILABLE"
        }]}"#;
        let env: Envelope<Vec<PlatformImage>> = serde_json::from_str(out).unwrap();
        assert_eq!(env.data[0].kubernetes_version().unwrap(), "1.30");
        assert_eq!(env.data[0].architecture(), Some("amd64"));
    }

    #[test]
    fn parses_work_request_status() {
        let out = r#"{"data": {"id": "wr1", "status": "IN_PROGRESS", "percent-complete": 42.0}}"#;
        let env: Envelope<WorkRequest> = serde_json::from_str(out).unwrap();
        assert_eq!(env.data.status, WorkRequestStatus::InProgress);
        assert!(!env.data.status.is_terminal());
        assert!(WorkRequestStatus::Canceled.is_failure());
        assert!(!WorkRequestStatus::Succeeded.is_failure());
    }

    #[test]
    fn missing_version_tag_is_an_error() {
        let mut img = image("a", "1.30", "amd64", "2024-01-01T00:00:00Z");
        img.freeform_tags.remove(TAG_KUBERNETES);
        assert!(img.kubernetes_version().is_err());
    }

    #[test]
    fn version_matching_is_by_minor_unless_both_have_patches() {
        assert!(versions_match("1.30", "1.30.3"));
        assert!(versions_match("v1.30.3", "1.30.3"));
        assert!(!versions_match("1.30.2", "1.30.3"));
        assert!(!versions_match("1.29", "1.30"));
    }

    #[tokio::test]
    async fn newest_matching_image_wins() {
        let mut oci = MockOciClient::new();
        oci.expect_list_images().returning(|_, _| {
            Ok(vec![
                image("old", "1.30", "amd64", "2024-01-01T00:00:00Z"),
                image("new", "1.30", "amd64", "2024-03-01T00:00:00Z"),
                image("arm", "1.30", "arm64", "2024-06-01T00:00:00Z"),
                image("prev", "1.29", "amd64", "2024-07-01T00:00:00Z"),
            ])
        });
        let found = find_newest_image(&oci, "ocid1.compartment.c", "ock", "1.30", "amd64")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "new");
    }

    #[tokio::test]
    async fn no_matching_image_is_none() {
        let mut oci = MockOciClient::new();
        oci.expect_list_images()
            .returning(|_, _| Ok(vec![image("a", "1.29", "amd64", "2024-01-01T00:00:00Z")]));
        let found = find_newest_image(&oci, "ocid1.compartment.c", "ock", "1.31", "amd64")
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn import_tags_carry_version_and_arch() {
        let import = ImageImport {
            compartment: "c".into(),
            display_name: "ock".into(),
            namespace: "ns".into(),
            bucket: "b".into(),
            object_name: "o".into(),
            kubernetes_version: "1.31".into(),
            architecture: "arm64".into(),
        };
        let tags = import.freeform_tags();
        assert_eq!(tags[TAG_KUBERNETES], "1.31");
        assert_eq!(tags[TAG_ARCHITECTURE], "arm64");
    }
}
