//! Access to Cluster API objects on a management cluster
//!
//! Provides a trait-based abstraction over dynamic object operations, allowing
//! the graph builder and stage planner to be tested without a live cluster.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ocne_common::kube_utils::{build_api_resource, find_kubeconfig_secret};
use ocne_common::{Error, Result};

/// Operations on Cluster API objects in one management cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object; `None` if it does not exist
    async fn get(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List every object of a kind in a namespace
    async fn list(&self, namespace: &str, api_version: &str, kind: &str)
        -> Result<Vec<DynamicObject>>;

    /// Create an object in its namespace
    async fn create(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to an object
    async fn patch_merge(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Delete an object; absent objects are not an error
    async fn delete(&self, namespace: &str, api_version: &str, kind: &str, name: &str)
        -> Result<()>;

    /// Contents of the workload cluster kubeconfig secret, once it exists
    async fn kubeconfig_secret(&self, namespace: &str, cluster: &str) -> Result<Option<Vec<u8>>>;
}

/// [`ClusterApi`] over a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a client for the management cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, namespace: &str, api_version: &str, kind: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

fn object_type(object: &DynamicObject) -> Result<(String, String)> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::validation("object is missing apiVersion and kind"))?;
    Ok((types.api_version.clone(), types.kind.clone()))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(namespace, api_version, kind)
            .get_opt(name)
            .await
            .map_err(|e| Error::from(e).with_context(&format!("getting {kind} {namespace}/{name}")))
    }

    async fn list(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
    ) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(namespace, api_version, kind)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from(e).with_context(&format!("listing {kind} in {namespace}")))?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject> {
        let (api_version, kind) = object_type(object)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        debug!(kind = %kind, name = %name, "Creating object");
        self.api(namespace, &api_version, &kind)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| Error::from(e).with_context(&format!("creating {kind} {namespace}/{name}")))
    }

    async fn patch_merge(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.api(namespace, api_version, kind)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::from(e).with_context(&format!("patching {kind} {namespace}/{name}")))?;
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<()> {
        match self
            .api(namespace, api_version, kind)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from(e).with_context(&format!("deleting {kind} {namespace}/{name}"))),
        }
    }

    async fn kubeconfig_secret(&self, namespace: &str, cluster: &str) -> Result<Option<Vec<u8>>> {
        use k8s_openapi::api::core::v1::Secret;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = secrets
            .list(&ListParams::default().labels(&format!("{}={}", ocne_common::LABEL_CLUSTER_NAME, cluster)))
            .await?;
        Ok(find_kubeconfig_secret(&list.items, cluster)
            .and_then(|s| s.data.as_ref())
            .and_then(|d| d.get("value"))
            .map(|v| v.0.clone()))
    }
}

/// In-memory [`ClusterApi`] for tests that need a consistent object store
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemoryClusterApi {
        pub objects: Mutex<Vec<DynamicObject>>,
        pub created: Mutex<Vec<DynamicObject>>,
        pub patches: Mutex<Vec<(String, String, serde_json::Value)>>,
        pub gets: Mutex<Vec<(String, String)>>,
        pub kubeconfig: Option<Vec<u8>>,
    }

    impl MemoryClusterApi {
        pub fn with_objects(objects: Vec<serde_json::Value>) -> Self {
            let objects = objects
                .into_iter()
                .map(|v| serde_json::from_value(v).unwrap())
                .collect();
            Self {
                objects: Mutex::new(objects),
                ..Default::default()
            }
        }

        fn matches(o: &DynamicObject, namespace: &str, api_version: &str, kind: &str) -> bool {
            let t = o.types.as_ref().unwrap();
            t.api_version == api_version
                && t.kind == kind
                && o.metadata.namespace.as_deref() == Some(namespace)
        }
    }

    #[async_trait]
    impl ClusterApi for MemoryClusterApi {
        async fn get(
            &self,
            namespace: &str,
            api_version: &str,
            kind: &str,
            name: &str,
        ) -> Result<Option<DynamicObject>> {
            self.gets
                .lock()
                .unwrap()
                .push((kind.to_string(), name.to_string()));
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .find(|o| {
                    Self::matches(o, namespace, api_version, kind)
                        && o.metadata.name.as_deref() == Some(name)
                })
                .cloned())
        }

        async fn list(
            &self,
            namespace: &str,
            api_version: &str,
            kind: &str,
        ) -> Result<Vec<DynamicObject>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|o| Self::matches(o, namespace, api_version, kind))
                .cloned()
                .collect())
        }

        async fn create(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject> {
            let mut o = object.clone();
            o.metadata.namespace = Some(namespace.to_string());
            self.created.lock().unwrap().push(o.clone());
            self.objects.lock().unwrap().push(o.clone());
            Ok(o)
        }

        async fn patch_merge(
            &self,
            _namespace: &str,
            _api_version: &str,
            kind: &str,
            name: &str,
            patch: &serde_json::Value,
        ) -> Result<()> {
            self.patches
                .lock()
                .unwrap()
                .push((kind.to_string(), name.to_string(), patch.clone()));
            Ok(())
        }

        async fn delete(
            &self,
            _namespace: &str,
            _api_version: &str,
            kind: &str,
            name: &str,
        ) -> Result<()> {
            self.objects.lock().unwrap().retain(|o| {
                !(o.types.as_ref().map(|t| t.kind.as_str()) == Some(kind)
                    && o.metadata.name.as_deref() == Some(name))
            });
            Ok(())
        }

        async fn kubeconfig_secret(
            &self,
            _namespace: &str,
            _cluster: &str,
        ) -> Result<Option<Vec<u8>>> {
            Ok(self.kubeconfig.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_cluster_api_can_be_used() {
        let mut mock = MockClusterApi::new();
        mock.expect_get().returning(|_, _, _, _| Ok(None));
        let got = mock
            .get("demo", crate::CAPI_API_VERSION, crate::KIND_CLUSTER, "A")
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn mock_cluster_api_propagates_errors() {
        let mut mock = MockClusterApi::new();
        mock.expect_list()
            .returning(|_, _, _| Err(Error::transient("apiserver unavailable")));
        let err = mock
            .list("demo", crate::CAPI_API_VERSION, crate::KIND_MACHINE_DEPLOYMENT)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn object_type_requires_type_meta() {
        let o = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::Value::Null,
        };
        assert!(object_type(&o).is_err());
    }
}
