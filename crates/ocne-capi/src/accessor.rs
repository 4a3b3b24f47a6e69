//! Typed field paths into Cluster API objects
//!
//! Each accessor returns `Ok(None)` when the field is absent and an error when
//! it is present with the wrong type, so callers can tell "not set" from
//! "malformed". The known paths live as constants on the per-kind types.

use kube::api::DynamicObject;
use serde_json::Value;

use ocne_common::{Error, Result};

/// A path of mapping keys below the object root
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldPath(pub &'static [&'static str]);

impl FieldPath {
    /// Dotted form for messages, e.g. `spec.version`
    pub fn dotted(&self) -> String {
        self.0.join(".")
    }

    /// JSON pointer form for patches, e.g. `/spec/version`
    pub fn pointer(&self) -> String {
        self.0
            .iter()
            .map(|k| format!("/{}", k.replace('~', "~0").replace('/', "~1")))
            .collect()
    }

    /// Raw value at this path
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(root, |v, k| v.get(k))
    }

    /// String at this path
    pub fn string(&self, root: &Value) -> Result<Option<String>> {
        match self.get(root) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.wrong_type("string", other)),
        }
    }

    /// String at this path; absence is a validation error
    pub fn required_string(&self, root: &Value) -> Result<String> {
        self.string(root)?
            .ok_or_else(|| Error::validation_for_field(self.dotted(), "field is required"))
    }

    /// List of strings at this path
    pub fn strings(&self, root: &Value) -> Result<Option<Vec<String>>> {
        match self.get(root) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|i| match i {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(self.wrong_type("list of strings", other)),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(other) => Err(self.wrong_type("list", other)),
        }
    }

    /// List at this path
    pub fn list<'a>(&self, root: &'a Value) -> Result<Option<&'a Vec<Value>>> {
        match self.get(root) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => Ok(Some(items)),
            Some(other) => Err(self.wrong_type("list", other)),
        }
    }

    /// Set the value at this path, creating intermediate mappings
    pub fn set(&self, root: &mut Value, value: Value) -> Result<()> {
        let Some((last, parents)) = self.0.split_last() else {
            return Err(Error::validation("empty field path"));
        };
        let mut cur = root;
        for key in parents {
            if !cur.is_object() {
                *cur = Value::Object(Default::default());
            }
            cur = cur
                .as_object_mut()
                .map(|m| m.entry(key.to_string()).or_insert(Value::Null))
                .ok_or_else(|| Error::validation(format!("{} is not a mapping", self.dotted())))?;
        }
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        if let Some(m) = cur.as_object_mut() {
            m.insert(last.to_string(), value);
        }
        Ok(())
    }

    fn wrong_type(&self, expected: &str, got: &Value) -> Error {
        Error::validation_for_field(
            self.dotted(),
            format!("expected a {expected}, found {got}"),
        )
    }
}

/// Paths on KubeadmControlPlane objects
pub struct ControlPlane;

impl ControlPlane {
    /// Kubernetes version
    pub const VERSION: FieldPath = FieldPath(&["spec", "version"]);
    /// Machine template reference
    pub const INFRASTRUCTURE_REF: FieldPath =
        FieldPath(&["spec", "machineTemplate", "infrastructureRef"]);
    /// Name within the machine template reference
    pub const INFRASTRUCTURE_REF_NAME: FieldPath =
        FieldPath(&["spec", "machineTemplate", "infrastructureRef", "name"]);
    /// kubeadm patches applied on join
    pub const JOIN_PATCHES: FieldPath =
        FieldPath(&["spec", "kubeadmConfigSpec", "joinConfiguration", "patches"]);
    /// kubeadm phases skipped on join
    pub const JOIN_SKIP_PHASES: FieldPath =
        FieldPath(&["spec", "kubeadmConfigSpec", "joinConfiguration", "skipPhases"]);
}

/// Paths on infrastructure machine templates
pub struct MachineTemplate;

impl MachineTemplate {
    /// Platform image the machines boot from
    pub const IMAGE_ID: FieldPath = FieldPath(&["spec", "template", "spec", "imageId"]);
    /// Compute shape
    pub const SHAPE: FieldPath = FieldPath(&["spec", "template", "spec", "shape"]);
}

/// Paths on MachineDeployment objects
pub struct MachineDeployment;

impl MachineDeployment {
    /// Machine template reference
    pub const INFRASTRUCTURE_REF: FieldPath =
        FieldPath(&["spec", "template", "spec", "infrastructureRef"]);
    /// Name within the machine template reference
    pub const INFRASTRUCTURE_REF_NAME: FieldPath =
        FieldPath(&["spec", "template", "spec", "infrastructureRef", "name"]);
    /// Kubernetes version of the machines
    pub const VERSION: FieldPath = FieldPath(&["spec", "template", "spec", "version"]);
}

/// Paths on Cluster objects
pub struct Cluster;

impl Cluster {
    /// Infrastructure cluster reference
    pub const INFRASTRUCTURE_REF: FieldPath = FieldPath(&["spec", "infrastructureRef"]);
    /// Control plane reference
    pub const CONTROL_PLANE_REF: FieldPath = FieldPath(&["spec", "controlPlaneRef"]);
}

/// Paths on OCICluster objects
pub struct OciCluster;

impl OciCluster {
    /// API server endpoint host
    pub const ENDPOINT_HOST: FieldPath = FieldPath(&["spec", "controlPlaneEndpoint", "host"]);
    /// VCN id
    pub const VCN_ID: FieldPath = FieldPath(&["spec", "networkSpec", "vcn", "id"]);
    /// VCN subnets
    pub const SUBNETS: FieldPath = FieldPath(&["spec", "networkSpec", "vcn", "subnets"]);

    /// Ids of the subnets with role `service-lb`
    pub fn service_lb_subnets(root: &Value) -> Result<Vec<String>> {
        let Some(subnets) = Self::SUBNETS.list(root)? else {
            return Ok(Vec::new());
        };
        Ok(subnets
            .iter()
            .filter(|s| s.get("role").and_then(Value::as_str) == Some("service-lb"))
            .filter_map(|s| s.get("id").and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

/// A reference from one object to another
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectReference {
    /// API version of the referent
    pub api_version: String,
    /// Kind of the referent
    pub kind: String,
    /// Name of the referent
    pub name: String,
    /// Namespace, inherited from the referrer
    pub namespace: String,
}

impl ObjectReference {
    /// Read the reference at `path` in `referrer`
    ///
    /// Every one of apiVersion, kind and name must be present.
    pub fn at(referrer: &DynamicObject, path: FieldPath) -> Result<Self> {
        let referrer_name = referrer.metadata.name.as_deref().unwrap_or_default();
        let value = path.get(&referrer.data).ok_or_else(|| {
            Error::validation_for_field(
                path.dotted(),
                format!("reference missing on {referrer_name}"),
            )
        })?;
        let field = |key: &str| -> Result<String> {
            value
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::validation_for_field(
                        format!("{}.{}", path.dotted(), key),
                        format!("reference on {referrer_name} has no {key}"),
                    )
                })
        };
        Ok(Self {
            api_version: field("apiVersion")?,
            kind: field("kind")?,
            name: field("name")?,
            namespace: referrer.metadata.namespace.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn string_distinguishes_absent_from_malformed() {
        let v = json!({"spec": {"version": "v1.30.3"}});
        assert_eq!(
            ControlPlane::VERSION.string(&v).unwrap().as_deref(),
            Some("v1.30.3")
        );
        assert_eq!(MachineTemplate::IMAGE_ID.string(&v).unwrap(), None);
        let bad = json!({"spec": {"version": 130}});
        assert!(ControlPlane::VERSION.string(&bad).is_err());
    }

    #[test]
    fn pointer_form_for_patches() {
        assert_eq!(
            ControlPlane::INFRASTRUCTURE_REF_NAME.pointer(),
            "/spec/machineTemplate/infrastructureRef/name"
        );
    }

    #[test]
    fn set_creates_intermediate_mappings() {
        let mut v = json!({"spec": {}});
        MachineTemplate::IMAGE_ID
            .set(&mut v, json!("ocid1.image.new"))
            .unwrap();
        assert_eq!(v["spec"]["template"]["spec"]["imageId"], "ocid1.image.new");
    }

    #[test]
    fn reference_inherits_namespace() {
        let o = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": "A", "namespace": "demo"},
            "spec": {"infrastructureRef": {
                "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta2",
                "kind": "OCICluster",
                "name": "A"
            }}
        }));
        let r = ObjectReference::at(&o, Cluster::INFRASTRUCTURE_REF).unwrap();
        assert_eq!(r.kind, "OCICluster");
        assert_eq!(r.namespace, "demo");
    }

    #[test]
    fn reference_missing_a_field_is_a_validation_error() {
        let o = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": "A", "namespace": "demo"},
            "spec": {"controlPlaneRef": {"kind": "KubeadmControlPlane", "name": "A-cp"}}
        }));
        let err = ObjectReference::at(&o, Cluster::CONTROL_PLANE_REF).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(ObjectReference::at(&o, Cluster::INFRASTRUCTURE_REF).is_err());
    }

    #[test]
    fn service_lb_subnets_are_filtered_by_role() {
        let v = json!({"spec": {"networkSpec": {"vcn": {"subnets": [
            {"role": "control-plane-endpoint", "id": "a"},
            {"role": "service-lb", "id": "b"},
            {"role": "service-lb", "id": "c"}
        ]}}}});
        assert_eq!(OciCluster::service_lb_subnets(&v).unwrap(), vec!["b", "c"]);
        assert!(OciCluster::service_lb_subnets(&json!({})).unwrap().is_empty());
    }
}
