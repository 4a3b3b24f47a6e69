//! Resource graph of a Cluster API cluster
//!
//! Starting at the Cluster object, the builder follows `spec.infrastructureRef`
//! and `spec.controlPlaneRef`, the control plane's machine template reference,
//! and every MachineDeployment owned by the Cluster together with its machine
//! template. Every object lives exactly once in the graph's pool, keyed by
//! (group-version-kind, name); parents hold keys into the pool, never copies.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;
use tracing::{debug, info};

use ocne_common::{Error, Result};

use crate::accessor::{self, FieldPath, ObjectReference};
use crate::api::ClusterApi;
use crate::{
    CAPI_API_VERSION, KIND_CLUSTER, KIND_MACHINE, KIND_MACHINE_DEPLOYMENT, KIND_MACHINE_SET,
};

/// API version and kind of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvk {
    /// API version (e.g., "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Kind (e.g., "Cluster")
    pub kind: String,
}

impl Gvk {
    /// Create a new Gvk
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(g, _)| g)
            .unwrap_or("")
    }
}

/// Identity of a node in the graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphKey {
    /// Type of the object
    pub gvk: Gvk,
    /// Object name
    pub name: String,
}

impl GraphKey {
    /// Key for an object; fails if it has no type or name
    pub fn of(object: &DynamicObject) -> Result<Self> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::validation("object is missing apiVersion and kind"))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation(format!("{} object has no name", types.kind)))?;
        Ok(Self {
            gvk: Gvk::new(&types.api_version, &types.kind),
            name,
        })
    }

    /// Get a display string for logging
    pub fn display(&self) -> String {
        format!("{}/{}", self.gvk.kind, self.name)
    }
}

/// A resource and the keys of the resources it references
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The resource
    pub object: DynamicObject,
    /// Children by type, then name
    pub children: BTreeMap<Gvk, BTreeMap<String, GraphKey>>,
}

impl GraphNode {
    fn new(object: DynamicObject) -> Self {
        Self {
            object,
            children: BTreeMap::new(),
        }
    }

    /// All child keys
    pub fn child_keys(&self) -> impl Iterator<Item = &GraphKey> {
        self.children.values().flat_map(|m| m.values())
    }
}

/// The objects making up one cluster
#[derive(Debug, Default)]
pub struct ClusterGraph {
    all: BTreeMap<GraphKey, GraphNode>,
    /// The Cluster object
    pub cluster: Option<GraphKey>,
    /// The infrastructure cluster (e.g. OCICluster)
    pub infrastructure_cluster: Option<GraphKey>,
    /// The control plane (e.g. KubeadmControlPlane)
    pub control_plane: Option<GraphKey>,
    /// Machine templates referenced by the control plane or a MachineDeployment
    pub machine_templates: BTreeSet<GraphKey>,
    /// MachineDeployments by name
    pub machine_deployments: BTreeMap<String, GraphKey>,
    /// MachineSets by name
    pub machine_sets: BTreeMap<String, GraphKey>,
    /// Machines by name
    pub machines: BTreeMap<String, GraphKey>,
}

impl ClusterGraph {
    /// Insert an object, returning the key of the canonical node
    ///
    /// An object already in the pool is kept as is.
    pub fn insert(&mut self, object: DynamicObject) -> Result<GraphKey> {
        let key = GraphKey::of(&object)?;
        self.all
            .entry(key.clone())
            .or_insert_with(|| GraphNode::new(object));
        Ok(key)
    }

    /// Record `child` under `parent`
    pub fn link(&mut self, parent: &GraphKey, child: &GraphKey) -> Result<()> {
        if !self.all.contains_key(child) {
            return Err(Error::not_found(child.gvk.kind.clone(), child.name.clone()));
        }
        let node = self
            .all
            .get_mut(parent)
            .ok_or_else(|| Error::not_found(parent.gvk.kind.clone(), parent.name.clone()))?;
        node.children
            .entry(child.gvk.clone())
            .or_default()
            .insert(child.name.clone(), child.clone());
        Ok(())
    }

    /// True if the pool holds `key`
    pub fn contains(&self, key: &GraphKey) -> bool {
        self.all.contains_key(key)
    }

    /// Node for `key`
    pub fn node(&self, key: &GraphKey) -> Option<&GraphNode> {
        self.all.get(key)
    }

    /// Resource for `key`
    pub fn object(&self, key: &GraphKey) -> Result<&DynamicObject> {
        self.all
            .get(key)
            .map(|n| &n.object)
            .ok_or_else(|| Error::not_found(key.gvk.kind.clone(), key.name.clone()))
    }

    /// Number of distinct objects
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// True if the graph holds nothing
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Keys of every node that lists `key` as a child, in key order
    pub fn consumers_of(&self, key: &GraphKey) -> Vec<GraphKey> {
        self.all
            .iter()
            .filter(|(_, n)| {
                n.children
                    .get(&key.gvk)
                    .is_some_and(|m| m.get(&key.name) == Some(key))
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Resolve the reference at `path` on `parent`, fetching it if needed, and link it
    async fn follow(
        &mut self,
        api: &dyn ClusterApi,
        parent: &GraphKey,
        path: FieldPath,
    ) -> Result<GraphKey> {
        let reference = ObjectReference::at(self.object(parent)?, path)?;
        let key = GraphKey {
            gvk: Gvk::new(&reference.api_version, &reference.kind),
            name: reference.name.clone(),
        };
        if !self.contains(&key) {
            let object = api
                .get(
                    &reference.namespace,
                    &reference.api_version,
                    &reference.kind,
                    &reference.name,
                )
                .await?
                .ok_or_else(|| Error::not_found(reference.kind.clone(), reference.name.clone()))?;
            self.insert(with_types(object, &reference.api_version, &reference.kind))?;
        }
        self.link(parent, &key)?;
        debug!(parent = %parent.display(), child = %key.display(), "Linked object");
        Ok(key)
    }
}

/// Fill in type metadata the API server may omit
fn with_types(mut object: DynamicObject, api_version: &str, kind: &str) -> DynamicObject {
    if object.types.is_none() {
        object.types = Some(kube::core::TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        });
    }
    object
}

/// True if `object` has an owner reference to (`api_version`, `kind`, `name`)
pub fn is_owned_by(object: &DynamicObject, api_version: &str, kind: &str, name: &str) -> bool {
    object
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.api_version == api_version && r.kind == kind && r.name == name)
        })
}

/// Objects of (`api_version`, `kind`) in `namespace` owned by `owner`
pub async fn get_by_owner(
    api: &dyn ClusterApi,
    namespace: &str,
    api_version: &str,
    kind: &str,
    owner: &GraphKey,
) -> Result<Vec<DynamicObject>> {
    let objects = api.list(namespace, api_version, kind).await?;
    Ok(objects
        .into_iter()
        .filter(|o| is_owned_by(o, &owner.gvk.api_version, &owner.gvk.kind, &owner.name))
        .map(|o| with_types(o, api_version, kind))
        .collect())
}

/// Build the graph of the cluster `namespace/name`
pub async fn build_graph(api: &dyn ClusterApi, namespace: &str, name: &str) -> Result<ClusterGraph> {
    let mut graph = ClusterGraph::default();

    let cluster = api
        .get(namespace, CAPI_API_VERSION, KIND_CLUSTER, name)
        .await?
        .ok_or_else(|| Error::not_found(KIND_CLUSTER, format!("{namespace}/{name}")))?;
    let cluster_key = graph.insert(with_types(cluster, CAPI_API_VERSION, KIND_CLUSTER))?;
    graph.cluster = Some(cluster_key.clone());

    let infra = graph
        .follow(api, &cluster_key, accessor::Cluster::INFRASTRUCTURE_REF)
        .await?;
    graph.infrastructure_cluster = Some(infra);

    let control_plane = graph
        .follow(api, &cluster_key, accessor::Cluster::CONTROL_PLANE_REF)
        .await?;
    let cp_template = graph
        .follow(api, &control_plane, accessor::ControlPlane::INFRASTRUCTURE_REF)
        .await?;
    graph.machine_templates.insert(cp_template);

    for machine in get_by_owner(
        api,
        namespace,
        CAPI_API_VERSION,
        KIND_MACHINE,
        &control_plane,
    )
    .await?
    {
        let key = graph.insert(machine)?;
        graph.link(&control_plane, &key)?;
        graph.machines.insert(key.name.clone(), key);
    }
    graph.control_plane = Some(control_plane);

    for md in get_by_owner(
        api,
        namespace,
        CAPI_API_VERSION,
        KIND_MACHINE_DEPLOYMENT,
        &cluster_key,
    )
    .await?
    {
        let md_key = graph.insert(md)?;
        graph.link(&cluster_key, &md_key)?;
        let template = graph
            .follow(api, &md_key, accessor::MachineDeployment::INFRASTRUCTURE_REF)
            .await?;
        graph.machine_templates.insert(template);

        for ms in get_by_owner(api, namespace, CAPI_API_VERSION, KIND_MACHINE_SET, &md_key).await? {
            let ms_key = graph.insert(ms)?;
            graph.link(&md_key, &ms_key)?;
            for machine in
                get_by_owner(api, namespace, CAPI_API_VERSION, KIND_MACHINE, &ms_key).await?
            {
                let m_key = graph.insert(machine)?;
                graph.link(&ms_key, &m_key)?;
                graph.machines.insert(m_key.name.clone(), m_key);
            }
            graph.machine_sets.insert(ms_key.name.clone(), ms_key);
        }
        graph.machine_deployments.insert(md_key.name.clone(), md_key);
    }

    info!(
        cluster = %name,
        objects = graph.len(),
        templates = graph.machine_templates.len(),
        deployments = graph.machine_deployments.len(),
        "Built cluster graph"
    );
    Ok(graph)
}
