use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::*;

use super::{Store, StoreError, StoreObject};

/// [`Store`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::<K>::namespaced(self.client.clone(), namespace)
    }
}

fn object_namespace<K: StoreObject>(obj: &K) -> Result<&str, StoreError> {
    obj.meta()
        .namespace
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object misses \".metadata.namespace\"".to_string()))
}

fn object_name<K: StoreObject>(obj: &K) -> Result<&str, StoreError> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object misses \".metadata.name\"".to_string()))
}

impl Store for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        // A quorum read, so the reconciler never acts on a stale cache entry.
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(StoreError::from)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = object_namespace(obj)?;
        debug!(
            "Create {} {}/{}",
            K::kind(&()),
            namespace,
            object_name(obj)?
        );
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(StoreError::from)
    }

    async fn update<K: StoreObject>(&self, obj: &K, expected_version: &str) -> Result<K, StoreError> {
        let namespace = object_namespace(obj)?;
        let name = object_name(obj)?;
        // replace carries metadata.resourceVersion, which the API server checks
        // and answers with a Conflict when it is stale.
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = Some(expected_version.to_string());
        debug!(
            "Update {} {}/{} at rv {}",
            K::kind(&()),
            namespace,
            name,
            expected_version
        );
        self.api::<K>(namespace)
            .replace(name, &PostParams::default(), &obj)
            .await
            .map_err(StoreError::from)
    }

    async fn list<K: StoreObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(StoreError::from)?;
        Ok(list.items)
    }
}
