//! Staged upgrades of Cluster API clusters
//!
//! Staging moves a cluster toward a new kubernetes version without touching a
//! single machine. The planner walks the cluster graph, decides which platform
//! images must be rebuilt or adopted, imports them, creates sibling machine
//! templates that point at the new images, and hands back the JSON patches an
//! operator applies to roll the control plane and each MachineDeployment.
//!
//! Existing machine templates are never modified.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ocne_common::config::boot_image_for_version;
use ocne_common::image::ImageInspector;
use ocne_common::kube_utils::{
    write_kubeconfig_in, write_memory_kubeconfig, DEFAULT_POLL_INTERVAL, KUBECONFIG_SECRET_TIMEOUT,
};
use ocne_common::retry::{poll, Poll, RetryStrategy};
use ocne_common::{
    env_flag, Error, KubeVersion, Result, ANNOTATION_SKIP_COREDNS, ANNOTATION_SKIP_KUBE_PROXY,
    ENV_STAGE_FORCE_TEMPLATES, ENV_STAGE_FORCE_UPLOAD,
};

use crate::accessor::{self, FieldPath, ObjectReference};
use crate::api::ClusterApi;
use crate::builder::{boot_image_tag, BuiltImage, ImageProvider};
use crate::graph::{build_graph, ClusterGraph, GraphKey, Gvk};
use crate::naming::bump_name;
use crate::oci::{find_newest_image, versions_match, OciClient};
use crate::shape::{arch_from_shape, correct_image_capabilities};
use crate::workrequest::{wait_for_work_requests, WORK_REQUEST_POLL_INTERVAL};

/// kubeadm patches directory laid down by the ostree update
pub const OSTREE_PATCHES_DIR: &str = "/etc/ocne/ostree-patches";

/// kubeadm phase skipped when joining from an updated image
pub const SKIP_PHASE_PREFLIGHT: &str = "preflight";

/// Inputs of one staging run
#[derive(Clone, Debug)]
pub struct StageOptions {
    /// Namespace of the Cluster object
    pub namespace: String,
    /// Name of the Cluster object
    pub cluster_name: String,
    /// Kubernetes version to stage
    pub target_version: String,
    /// Rebuild images even when they look current
    pub force_upload: bool,
    /// Mint new templates even when no image changed
    pub force_templates: bool,
    /// Compartment holding the platform images
    pub compartment: String,
    /// Display name of the platform images
    pub image_name: String,
    /// Poll interval for image imports
    pub work_request_interval: Duration,
    /// Render progress bars
    pub show_ui: bool,
    /// How long to wait for the workload kubeconfig secret
    pub kubeconfig_timeout: Duration,
    /// Write the workload kubeconfig here instead of memory-backed storage
    pub kubeconfig_dir: Option<PathBuf>,
}

impl StageOptions {
    /// Options with defaults; the force flags come from the environment
    pub fn new(
        namespace: impl Into<String>,
        cluster_name: impl Into<String>,
        target_version: impl Into<String>,
        compartment: impl Into<String>,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster_name: cluster_name.into(),
            target_version: target_version.into(),
            force_upload: env_flag(ENV_STAGE_FORCE_UPLOAD),
            force_templates: env_flag(ENV_STAGE_FORCE_TEMPLATES),
            compartment: compartment.into(),
            image_name: image_name.into(),
            work_request_interval: WORK_REQUEST_POLL_INTERVAL,
            show_ui: true,
            kubeconfig_timeout: KUBECONFIG_SECRET_TIMEOUT,
            kubeconfig_dir: None,
        }
    }
}

/// What a staging run produced
#[derive(Clone, Debug)]
pub struct StageResult {
    /// Kubeconfig of the workload cluster
    pub kubeconfig: PathBuf,
    /// Commands that roll the cluster; empty when nothing needs rolling
    pub help_text: String,
    /// Whether the staging path ran
    pub changed: bool,
}

/// Everything [`do_update`] looks at for one platform image
#[derive(Clone, Debug)]
pub struct UpdateFacts {
    /// Rebuild was forced
    pub force: bool,
    /// Kubernetes version tag on the current image
    pub image_version: String,
    /// Version being staged
    pub target: String,
    /// The current image is the newest one for its name, version and architecture
    pub is_newest: bool,
    /// Build time of the boot disk container image, if it could be read
    pub container_created: Option<DateTime<Utc>>,
    /// Creation time of the current image
    pub image_created: DateTime<Utc>,
    /// Some image already exists for the target version and architecture
    pub target_image_exists: bool,
}

/// Whether an image has to be rebuilt for the target version
///
/// Same version: only if this is the newest image and the container image was
/// rebuilt after it. Different version: only if no image for the target exists
/// yet.
pub fn do_update(facts: &UpdateFacts) -> bool {
    if facts.force {
        return true;
    }
    if versions_match(&facts.image_version, &facts.target) {
        facts.is_newest
            && facts
                .container_created
                .is_some_and(|created| created > facts.image_created)
    } else {
        !facts.target_image_exists
    }
}

/// One platform image and the machine templates that boot from it
#[derive(Clone, Debug)]
pub struct ImageData {
    /// Current image OCID
    pub image: String,
    /// Architecture derived from the template shape
    pub arch: String,
    /// A rebuild was decided
    pub has_update: bool,
    /// Image the templates should move to, if any
    pub new_image_id: Option<String>,
    /// Import in flight for the new image
    pub work_request_id: Option<String>,
    /// Templates referencing the image
    pub machine_templates: Vec<GraphKey>,
    image_version: String,
    target_image: Option<String>,
}

/// Stages upgrades of one management cluster's workload clusters
pub struct StagePlanner {
    api: Arc<dyn ClusterApi>,
    oci: Arc<dyn OciClient>,
    images: Arc<dyn ImageProvider>,
    inspector: Arc<dyn ImageInspector>,
    boot_image: String,
}

impl StagePlanner {
    /// A planner over the given seams
    pub fn new(
        api: Arc<dyn ClusterApi>,
        oci: Arc<dyn OciClient>,
        images: Arc<dyn ImageProvider>,
        inspector: Arc<dyn ImageInspector>,
        boot_image: impl Into<String>,
    ) -> Self {
        Self {
            api,
            oci,
            images,
            inspector,
            boot_image: boot_image.into(),
        }
    }

    /// Stage `opts.target_version` for the cluster `opts.namespace/opts.cluster_name`
    pub async fn stage(&self, opts: &StageOptions) -> Result<StageResult> {
        let target = KubeVersion::parse(&opts.target_version)?;
        let graph = build_graph(self.api.as_ref(), &opts.namespace, &opts.cluster_name).await?;
        let cp_key = graph
            .control_plane
            .clone()
            .ok_or_else(|| Error::not_found("control plane", opts.cluster_name.clone()))?;

        self.ensure_control_plane_annotations(&opts.namespace, graph.object(&cp_key)?)
            .await?;

        let current = accessor::ControlPlane::VERSION.required_string(&graph.object(&cp_key)?.data)?;
        let minor_changed = !KubeVersion::parse(&current)?.same_minor(&target);
        info!(
            cluster = %opts.cluster_name,
            current = %current,
            target = %opts.target_version,
            minor_changed,
            "Staging cluster update"
        );

        let mut images = collect_images(&graph)?;
        for data in images.values_mut() {
            self.decide(opts, data).await?;
        }

        let requests = self.build_images(opts, &mut images, minor_changed).await?;
        wait_for_work_requests(
            self.oci.clone(),
            &requests.labels,
            opts.work_request_interval,
            opts.show_ui,
        )
        .await?;
        for built in requests.imported.values() {
            correct_image_capabilities(
                self.oci.as_ref(),
                &opts.compartment,
                &built.image_id,
                &built.arch,
            )
            .await?;
        }

        let renamed = self.create_templates(opts, &graph, &images).await?;
        let help_text = rollout_instructions(opts, &graph, &renamed)?;

        let kubeconfig = self.workload_kubeconfig(opts).await?;
        Ok(StageResult {
            kubeconfig,
            help_text,
            changed: true,
        })
    }

    async fn ensure_control_plane_annotations(
        &self,
        namespace: &str,
        control_plane: &DynamicObject,
    ) -> Result<()> {
        let annotations = control_plane.metadata.annotations.clone().unwrap_or_default();
        let wanted = [ANNOTATION_SKIP_KUBE_PROXY, ANNOTATION_SKIP_COREDNS];
        if wanted
            .iter()
            .all(|a| annotations.get(*a).map(String::as_str) == Some("true"))
        {
            return Ok(());
        }
        let key = GraphKey::of(control_plane)?;
        let patch = json!({"metadata": {"annotations": {
            ANNOTATION_SKIP_KUBE_PROXY: "true",
            ANNOTATION_SKIP_COREDNS: "true",
        }}});
        self.api
            .patch_merge(namespace, &key.gvk.api_version, &key.gvk.kind, &key.name, &patch)
            .await?;
        info!(control_plane = %key.name, "Annotated control plane to skip kube-proxy and CoreDNS");
        Ok(())
    }

    /// Fill in `has_update` and the existing target image for one image
    async fn decide(&self, opts: &StageOptions, data: &mut ImageData) -> Result<()> {
        let platform = self.oci.get_image(&data.image).await?;
        data.image_version = platform.kubernetes_version()?.to_string();

        let newest = find_newest_image(
            self.oci.as_ref(),
            &opts.compartment,
            &opts.image_name,
            &data.image_version,
            &data.arch,
        )
        .await?;
        let is_newest = newest.is_some_and(|n| n.id == platform.id);

        data.target_image = find_newest_image(
            self.oci.as_ref(),
            &opts.compartment,
            &opts.image_name,
            &opts.target_version,
            &data.arch,
        )
        .await?
        .map(|i| i.id);

        let container = boot_image_for_version(&self.boot_image, &boot_image_tag(&opts.target_version));
        let container_created = match self.inspector.created(&container, &data.arch).await {
            Ok(created) => Some(created),
            Err(e) => {
                warn!(image = %container, error = %e, "Could not read boot image build time");
                None
            }
        };

        data.has_update = do_update(&UpdateFacts {
            force: opts.force_upload,
            image_version: data.image_version.clone(),
            target: opts.target_version.clone(),
            is_newest,
            container_created,
            image_created: platform.time_created,
            target_image_exists: data.target_image.is_some(),
        });
        debug!(
            image = %data.image,
            arch = %data.arch,
            version = %data.image_version,
            has_update = data.has_update,
            "Evaluated image"
        );
        Ok(())
    }

    /// Start builds for images needing one and adopt existing images on a minor change
    async fn build_images(
        &self,
        opts: &StageOptions,
        images: &mut BTreeMap<String, ImageData>,
        minor_changed: bool,
    ) -> Result<Imports> {
        let mut imports = Imports::default();
        let mut by_arch: BTreeMap<String, BuiltImage> = BTreeMap::new();

        for data in images.values_mut() {
            if data.has_update {
                let built = match by_arch.get(&data.arch) {
                    Some(built) => built.clone(),
                    None => {
                        let force = opts.force_upload
                            || versions_match(&data.image_version, &opts.target_version);
                        let built = self
                            .images
                            .ensure_image(&opts.image_name, &data.arch, &opts.target_version, force)
                            .await?;
                        if let Some(wr) = &built.work_request_id {
                            imports.labels.insert(
                                wr.clone(),
                                format!("Importing {} image for {}", data.arch, opts.target_version),
                            );
                            imports.imported.insert(
                                wr.clone(),
                                Imported {
                                    image_id: built.image_id.clone(),
                                    arch: data.arch.clone(),
                                },
                            );
                        }
                        by_arch.insert(data.arch.clone(), built.clone());
                        built
                    }
                };
                data.new_image_id = Some(built.image_id);
                data.work_request_id = built.work_request_id;
            } else if minor_changed {
                if let Some(existing) = &data.target_image {
                    if *existing != data.image {
                        info!(image = %existing, arch = %data.arch, "Adopting existing image");
                        data.new_image_id = Some(existing.clone());
                    }
                }
            }
        }
        Ok(imports)
    }

    /// Create sibling templates for every template whose image changes
    ///
    /// Returns the new template name for each replaced template.
    async fn create_templates(
        &self,
        opts: &StageOptions,
        graph: &ClusterGraph,
        images: &BTreeMap<String, ImageData>,
    ) -> Result<BTreeMap<GraphKey, String>> {
        let mut renamed = BTreeMap::new();
        for data in images.values() {
            let new_image = match &data.new_image_id {
                Some(id) if *id != data.image => id.clone(),
                _ if opts.force_templates => {
                    data.new_image_id.clone().unwrap_or_else(|| data.image.clone())
                }
                _ => continue,
            };
            for key in &data.machine_templates {
                let template = graph.object(key)?;
                let name = self.free_name(&opts.namespace, key).await?;
                let sibling = sibling_template(template, &name, &new_image)?;
                self.api.create(&opts.namespace, &sibling).await?;
                info!(from = %key.name, to = %name, image = %new_image, "Created machine template");
                renamed.insert(key.clone(), name);
            }
        }
        Ok(renamed)
    }

    /// First bumped name not already taken
    async fn free_name(&self, namespace: &str, key: &GraphKey) -> Result<String> {
        let mut name = bump_name(&key.name);
        while self
            .api
            .get(namespace, &key.gvk.api_version, &key.gvk.kind, &name)
            .await?
            .is_some()
        {
            name = bump_name(&name);
        }
        Ok(name)
    }

    async fn workload_kubeconfig(&self, opts: &StageOptions) -> Result<PathBuf> {
        let strategy = RetryStrategy::linear(DEFAULT_POLL_INTERVAL, opts.kubeconfig_timeout);
        let what = format!("kubeconfig of cluster {}", opts.cluster_name);
        let api = &self.api;
        let (namespace, cluster) = (opts.namespace.as_str(), opts.cluster_name.as_str());
        let contents = poll(&strategy, &what, || async move {
            Ok(match api.kubeconfig_secret(namespace, cluster).await? {
                Some(contents) => Poll::Ready(contents),
                None => Poll::Pending,
            })
        })
        .await?;
        match &opts.kubeconfig_dir {
            Some(dir) => write_kubeconfig_in(dir, &opts.cluster_name, &contents),
            None => write_memory_kubeconfig(&opts.cluster_name, &contents),
        }
    }
}

#[derive(Default)]
struct Imports {
    /// Work request id to progress label
    labels: BTreeMap<String, String>,
    /// Work request id to the image it imports
    imported: BTreeMap<String, Imported>,
}

struct Imported {
    image_id: String,
    arch: String,
}

/// Group the cluster's machine templates by the image they boot from
fn collect_images(graph: &ClusterGraph) -> Result<BTreeMap<String, ImageData>> {
    let mut images: BTreeMap<String, ImageData> = BTreeMap::new();
    for key in &graph.machine_templates {
        let template = graph.object(key)?;
        let image = accessor::MachineTemplate::IMAGE_ID.required_string(&template.data)?;
        let shape = accessor::MachineTemplate::SHAPE
            .string(&template.data)?
            .unwrap_or_default();
        images
            .entry(image.clone())
            .or_insert_with(|| ImageData {
                image,
                arch: arch_from_shape(&shape).to_string(),
                has_update: false,
                new_image_id: None,
                work_request_id: None,
                machine_templates: Vec::new(),
                image_version: String::new(),
                target_image: None,
            })
            .machine_templates
            .push(key.clone());
    }
    Ok(images)
}

/// Copy of `template` named `name` booting `image`, stripped of server state
pub fn sibling_template(template: &DynamicObject, name: &str, image: &str) -> Result<DynamicObject> {
    let mut sibling = template.clone();
    let meta = &mut sibling.metadata;
    meta.name = Some(name.to_string());
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    if let Some(data) = sibling.data.as_object_mut() {
        data.remove("status");
    }
    accessor::MachineTemplate::IMAGE_ID.set(&mut sibling.data, json!(image))?;
    Ok(sibling)
}

/// Version string as Cluster API spells it
fn capi_version(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

fn replace(path: FieldPath, value: impl Into<Value>) -> Value {
    json!({"op": "replace", "path": path.pointer(), "value": value.into()})
}

/// JSON patch moving the control plane to `template` at `version`
pub fn control_plane_patch(control_plane: &DynamicObject, template: &str, version: &str) -> Result<Value> {
    let mut ops = vec![
        replace(accessor::ControlPlane::VERSION, capi_version(version)),
        replace(accessor::ControlPlane::INFRASTRUCTURE_REF_NAME, template),
    ];
    if accessor::ControlPlane::JOIN_PATCHES
        .get(&control_plane.data)
        .is_none()
    {
        ops.push(json!({
            "op": "add",
            "path": accessor::ControlPlane::JOIN_PATCHES.pointer(),
            "value": {"directory": OSTREE_PATCHES_DIR},
        }));
    }
    match accessor::ControlPlane::JOIN_SKIP_PHASES.strings(&control_plane.data)? {
        None => ops.push(json!({
            "op": "add",
            "path": accessor::ControlPlane::JOIN_SKIP_PHASES.pointer(),
            "value": [SKIP_PHASE_PREFLIGHT],
        })),
        Some(phases) if !phases.iter().any(|p| p == SKIP_PHASE_PREFLIGHT) => ops.push(json!({
            "op": "add",
            "path": format!("{}/-", accessor::ControlPlane::JOIN_SKIP_PHASES.pointer()),
            "value": SKIP_PHASE_PREFLIGHT,
        })),
        Some(_) => {}
    }
    Ok(Value::Array(ops))
}

/// JSON patch moving a MachineDeployment to `template` at `version`
pub fn machine_deployment_patch(template: &str, version: &str) -> Value {
    Value::Array(vec![
        replace(accessor::MachineDeployment::VERSION, capi_version(version)),
        replace(accessor::MachineDeployment::INFRASTRUCTURE_REF_NAME, template),
    ])
}

/// `kubectl patch` invocation applying `patch` to `key`
pub fn patch_command(namespace: &str, key: &GraphKey, patch: &Value) -> String {
    format!(
        "kubectl patch -n {namespace} {} {} --type=json -p='{patch}'",
        resource_name(&key.gvk),
        key.name
    )
}

fn resource_name(gvk: &Gvk) -> String {
    let kind = gvk.kind.to_lowercase();
    match gvk.group() {
        "" => kind,
        group => format!("{kind}.{group}"),
    }
}

/// Key of the template `path` on `owner` refers to
fn referenced_template(owner: &DynamicObject, path: FieldPath) -> Result<GraphKey> {
    let reference = ObjectReference::at(owner, path)?;
    Ok(GraphKey {
        gvk: Gvk::new(&reference.api_version, &reference.kind),
        name: reference.name,
    })
}

/// Commands rolling the control plane first, then each MachineDeployment
fn rollout_instructions(
    opts: &StageOptions,
    graph: &ClusterGraph,
    renamed: &BTreeMap<GraphKey, String>,
) -> Result<String> {
    let mut commands = Vec::new();

    if let Some(cp_key) = &graph.control_plane {
        let cp = graph.object(cp_key)?;
        let template = referenced_template(cp, accessor::ControlPlane::INFRASTRUCTURE_REF)?;
        if let Some(new_name) = renamed.get(&template) {
            let patch = control_plane_patch(cp, new_name, &opts.target_version)?;
            commands.push(patch_command(&opts.namespace, cp_key, &patch));
        }
    }

    for md_key in graph.machine_deployments.values() {
        let md = graph.object(md_key)?;
        let template = referenced_template(md, accessor::MachineDeployment::INFRASTRUCTURE_REF)?;
        if let Some(new_name) = renamed.get(&template) {
            let patch = machine_deployment_patch(new_name, &opts.target_version);
            commands.push(patch_command(&opts.namespace, md_key, &patch));
        }
    }

    if commands.is_empty() {
        return Ok(String::new());
    }
    Ok(format!(
        "To update the cluster to Kubernetes {}, run:\n\n{}\n",
        opts.target_version,
        commands.join("\n\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryClusterApi;
    use crate::builder::mocks::MockImageInspector;
    use crate::builder::MockImageProvider;
    use crate::graph::fixtures::*;
    use crate::oci::fixtures::image;
    use crate::oci::{MockOciClient, WorkRequest, WorkRequestStatus};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn objects(cp_version: &str, image: &str) -> Vec<Value> {
        vec![
            cluster("A"),
            oci_cluster("A"),
            control_plane("A-cp", "A-mt", cp_version),
            machine_template("A-mt", image, "VM.Standard.E4.Flex"),
            machine_deployment("A-md", "A", "A-mt", cp_version),
        ]
    }

    fn options(target: &str, dir: &std::path::Path) -> StageOptions {
        let mut opts = StageOptions::new("demo", "A", target, "ocid1.compartment.c", "ock");
        opts.force_upload = false;
        opts.force_templates = false;
        opts.work_request_interval = Duration::from_millis(5);
        opts.show_ui = false;
        opts.kubeconfig_timeout = Duration::from_secs(1);
        opts.kubeconfig_dir = Some(dir.to_path_buf());
        opts
    }

    fn memory_api(objects: Vec<Value>) -> Arc<MemoryClusterApi> {
        let mut api = MemoryClusterApi::with_objects(objects);
        api.kubeconfig = Some(b"apiVersion: v1\nkind: Config\n".to_vec());
        Arc::new(api)
    }

    fn inspector(created: &'static str) -> MockImageInspector {
        let mut inspector = MockImageInspector::new();
        inspector
            .expect_created()
            .returning(move |_, _| Ok(ts(created)));
        inspector
    }

    fn oci_with(images: Vec<crate::oci::PlatformImage>) -> MockOciClient {
        let mut oci = MockOciClient::new();
        let all = images.clone();
        oci.expect_get_image().returning(move |id| {
            all.iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or_else(|| Error::not_found("image", id))
        });
        oci.expect_list_images()
            .returning(move |_, _| Ok(images.clone()));
        oci
    }

    // ==========================================================================
    // Story Tests: staging against a live-looking cluster
    // ==========================================================================

    /// Story: the image is current and the container was not rebuilt, so
    /// staging only ensures the annotations and returns no instructions
    #[tokio::test]
    async fn story_stage_with_current_image_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let api = memory_api(objects("v1.30.1", "img-1"));
        let oci = oci_with(vec![image("img-1", "1.30", "amd64", "2024-06-01T00:00:00Z")]);
        let mut images = MockImageProvider::new();
        images.expect_ensure_image().times(0);

        let planner = StagePlanner::new(
            api.clone(),
            Arc::new(oci),
            Arc::new(images),
            Arc::new(inspector("2024-01-01T00:00:00Z")),
            "registry.example/ock",
        );
        let result = planner.stage(&options("1.30.1", dir.path())).await.unwrap();

        assert!(result.changed);
        assert!(result.help_text.is_empty());
        assert!(api.created.lock().unwrap().is_empty());
        let patches = api.patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "KubeadmControlPlane");
        assert_eq!(
            patches[0].2["metadata"]["annotations"][ANNOTATION_SKIP_COREDNS],
            "true"
        );
        assert!(result.kubeconfig.exists());
    }

    /// Story: a rebuilt container image produces a new platform image; the
    /// planner creates a sibling template and leaves the original alone
    #[tokio::test]
    async fn story_rebuilt_container_image_creates_sibling_templates() {
        let dir = tempfile::tempdir().unwrap();
        let api = memory_api(objects("v1.30.1", "img-1"));
        let mut oci = oci_with(vec![image("img-1", "1.30", "amd64", "2024-01-01T00:00:00Z")]);
        oci.expect_get_work_request().returning(|id| {
            Ok(WorkRequest {
                id: id.to_string(),
                status: WorkRequestStatus::Succeeded,
                percent_complete: 100.0,
            })
        });
        oci.expect_create_capability_schema()
            .withf(|_, image, _| image == "img-2")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut images = MockImageProvider::new();
        images
            .expect_ensure_image()
            .withf(|name, arch, version, force| {
                name == "ock" && arch == "amd64" && version == "1.30.1" && *force
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(BuiltImage {
                    image_id: "img-2".to_string(),
                    work_request_id: Some("wr-1".to_string()),
                })
            });

        let planner = StagePlanner::new(
            api.clone(),
            Arc::new(oci),
            Arc::new(images),
            Arc::new(inspector("2024-06-01T00:00:00Z")),
            "registry.example/ock",
        );
        let result = planner.stage(&options("1.30.1", dir.path())).await.unwrap();

        let created = api.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].metadata.name.as_deref(), Some("A-mt-1"));
        assert_eq!(created[0].metadata.uid, None);
        assert_eq!(created[0].data["spec"]["template"]["spec"]["imageId"], "img-2");

        // only the annotation patch touched the server; no template was patched
        let patches = api.patches.lock().unwrap();
        assert!(patches.iter().all(|(kind, _, _)| kind == "KubeadmControlPlane"));
        let original = api
            .objects
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.metadata.name.as_deref() == Some("A-mt"))
            .cloned()
            .unwrap();
        assert_eq!(original.data["spec"]["template"]["spec"]["imageId"], "img-1");

        let cp = result
            .help_text
            .find("kubeadmcontrolplane.controlplane.cluster.x-k8s.io A-cp")
            .unwrap();
        let md = result
            .help_text
            .find("machinedeployment.cluster.x-k8s.io A-md")
            .unwrap();
        assert!(cp < md);
        assert!(result.help_text.contains("\"v1.30.1\""));
        assert!(result.help_text.contains(SKIP_PHASE_PREFLIGHT));
    }

    /// Story: a minor upgrade to a version whose image already exists adopts
    /// that image without building anything
    #[tokio::test]
    async fn story_minor_upgrade_adopts_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let api = memory_api(objects("v1.29.3", "img-29"));
        let oci = oci_with(vec![
            image("img-29", "1.29", "amd64", "2024-01-01T00:00:00Z"),
            image("img-30", "1.30", "amd64", "2024-06-01T00:00:00Z"),
        ]);
        let mut images = MockImageProvider::new();
        images.expect_ensure_image().times(0);

        let planner = StagePlanner::new(
            api.clone(),
            Arc::new(oci),
            Arc::new(images),
            Arc::new(inspector("2024-01-01T00:00:00Z")),
            "registry.example/ock",
        );
        let result = planner.stage(&options("1.30.0", dir.path())).await.unwrap();

        let created = api.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].data["spec"]["template"]["spec"]["imageId"], "img-30");
        assert!(result.help_text.contains("A-mt-1"));
    }

    #[tokio::test]
    async fn unreadable_container_image_means_no_update() {
        let dir = tempfile::tempdir().unwrap();
        let api = memory_api(objects("v1.30.1", "img-1"));
        let oci = oci_with(vec![image("img-1", "1.30", "amd64", "2024-01-01T00:00:00Z")]);
        let mut images = MockImageProvider::new();
        images.expect_ensure_image().times(0);
        let mut inspector = MockImageInspector::new();
        inspector
            .expect_created()
            .returning(|image, _| Err(Error::command("skopeo", format!("{image}: unauthorized"))));

        let planner = StagePlanner::new(
            api.clone(),
            Arc::new(oci),
            Arc::new(images),
            Arc::new(inspector),
            "registry.example/ock",
        );
        let result = planner.stage(&options("1.30.1", dir.path())).await.unwrap();
        assert!(result.help_text.is_empty());
    }

    #[tokio::test]
    async fn annotated_control_plane_is_not_patched() {
        let dir = tempfile::tempdir().unwrap();
        let mut objs = objects("v1.30.1", "img-1");
        objs[2]["metadata"]["annotations"] = json!({
            ANNOTATION_SKIP_KUBE_PROXY: "true",
            ANNOTATION_SKIP_COREDNS: "true",
        });
        let api = memory_api(objs);
        let oci = oci_with(vec![image("img-1", "1.30", "amd64", "2024-06-01T00:00:00Z")]);
        let planner = StagePlanner::new(
            api.clone(),
            Arc::new(oci),
            Arc::new(MockImageProvider::new()),
            Arc::new(inspector("2024-01-01T00:00:00Z")),
            "registry.example/ock",
        );
        planner.stage(&options("1.30.1", dir.path())).await.unwrap();
        assert!(api.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_kubeconfig_secret_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MemoryClusterApi::with_objects(objects("v1.30.1", "img-1")));
        let oci = oci_with(vec![image("img-1", "1.30", "amd64", "2024-06-01T00:00:00Z")]);
        let planner = StagePlanner::new(
            api,
            Arc::new(oci),
            Arc::new(MockImageProvider::new()),
            Arc::new(inspector("2024-01-01T00:00:00Z")),
            "registry.example/ock",
        );
        let mut opts = options("1.30.1", dir.path());
        opts.kubeconfig_timeout = Duration::from_millis(10);
        let err = planner.stage(&opts).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    // ==========================================================================
    // Update decision
    // ==========================================================================

    fn facts() -> UpdateFacts {
        UpdateFacts {
            force: false,
            image_version: "1.30".to_string(),
            target: "1.30.1".to_string(),
            is_newest: true,
            container_created: Some(ts("2024-06-01T00:00:00Z")),
            image_created: ts("2024-01-01T00:00:00Z"),
            target_image_exists: true,
        }
    }

    #[test]
    fn same_version_rebuilds_only_newest_image_behind_its_container() {
        assert!(do_update(&facts()));
        assert!(!do_update(&UpdateFacts {
            is_newest: false,
            ..facts()
        }));
        assert!(!do_update(&UpdateFacts {
            container_created: Some(ts("2023-01-01T00:00:00Z")),
            ..facts()
        }));
        assert!(!do_update(&UpdateFacts {
            container_created: None,
            ..facts()
        }));
    }

    #[test]
    fn new_version_builds_only_when_no_image_exists() {
        let other = UpdateFacts {
            image_version: "1.29".to_string(),
            ..facts()
        };
        assert!(!do_update(&other));
        assert!(do_update(&UpdateFacts {
            target_image_exists: false,
            ..other
        }));
    }

    #[test]
    fn force_always_updates() {
        assert!(do_update(&UpdateFacts {
            force: true,
            is_newest: false,
            container_created: None,
            ..facts()
        }));
    }

    // ==========================================================================
    // Patches
    // ==========================================================================

    fn object(v: Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn control_plane_patch_adds_join_settings_only_when_absent() {
        let cp = object(control_plane("A-cp", "A-mt", "v1.29.0"));
        let patch = control_plane_patch(&cp, "A-mt-1", "1.30.0").unwrap();
        let ops = patch.as_array().unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0]["path"], "/spec/version");
        assert_eq!(ops[0]["value"], "v1.30.0");
        assert_eq!(ops[1]["path"], "/spec/machineTemplate/infrastructureRef/name");
        assert_eq!(ops[2]["value"]["directory"], OSTREE_PATCHES_DIR);
        assert_eq!(ops[3]["value"], json!(["preflight"]));

        let mut with_join = control_plane("A-cp", "A-mt", "v1.29.0");
        with_join["spec"]["kubeadmConfigSpec"]["joinConfiguration"] = json!({
            "patches": {"directory": "/custom"},
            "skipPhases": ["addon/kube-proxy"]
        });
        let patch = control_plane_patch(&object(with_join), "A-mt-1", "v1.30.0").unwrap();
        let ops = patch.as_array().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[2]["path"],
            "/spec/kubeadmConfigSpec/joinConfiguration/skipPhases/-"
        );

        let mut done = control_plane("A-cp", "A-mt", "v1.29.0");
        done["spec"]["kubeadmConfigSpec"]["joinConfiguration"] = json!({
            "patches": {"directory": OSTREE_PATCHES_DIR},
            "skipPhases": ["preflight"]
        });
        let patch = control_plane_patch(&object(done), "A-mt-1", "v1.30.0").unwrap();
        assert_eq!(patch.as_array().unwrap().len(), 2);
    }

    #[test]
    fn machine_deployment_patch_replaces_version_and_template() {
        let patch = machine_deployment_patch("A-mt-1", "1.30.0");
        assert_eq!(patch[0]["path"], "/spec/template/spec/version");
        assert_eq!(patch[0]["value"], "v1.30.0");
        assert_eq!(patch[1]["path"], "/spec/template/spec/infrastructureRef/name");
        assert_eq!(patch[1]["value"], "A-mt-1");
    }

    #[test]
    fn patch_command_names_group_qualified_resource() {
        let key = GraphKey {
            gvk: Gvk::new("cluster.x-k8s.io/v1beta1", "MachineDeployment"),
            name: "A-md".to_string(),
        };
        let cmd = patch_command("demo", &key, &json!([]));
        assert_eq!(
            cmd,
            "kubectl patch -n demo machinedeployment.cluster.x-k8s.io A-md --type=json -p='[]'"
        );
    }

    #[test]
    fn sibling_drops_server_state() {
        let mut template = machine_template("A-mt", "img-1", "VM.Standard.E4.Flex");
        template["status"] = json!({"ready": true});
        let sibling = sibling_template(&object(template), "A-mt-1", "img-2").unwrap();
        assert_eq!(sibling.metadata.name.as_deref(), Some("A-mt-1"));
        assert!(sibling.metadata.resource_version.is_none());
        assert!(sibling.metadata.creation_timestamp.is_none());
        assert!(sibling.data.get("status").is_none());
        assert_eq!(sibling.data["spec"]["template"]["spec"]["imageId"], "img-2");
    }
}
