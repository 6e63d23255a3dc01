//! Writes against the cluster state

use async_trait::async_trait;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};

use super::ClusterResource;
use crate::error::{Error, Result};

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "app-operator";

/// Mutating access to one resource kind.
///
/// Conflicts from optimistic concurrency are surfaced as errors and retried
/// by the caller; implementations never retry on their own.
#[async_trait]
pub trait ClusterClient<K>: Send + Sync {
    /// Live object, bypassing any cache
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, obj: &K) -> Result<()>;

    /// Replace the object; its `resourceVersion` guards against lost updates
    async fn update(&self, obj: &K) -> Result<()>;

    /// Delete the object. Deleting a missing object succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterClient`] for every namespaced kind, backed by the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: ClusterResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Namespace and name of an object about to be written
fn identity<K: ClusterResource>(obj: &K) -> Result<(String, String)> {
    match (obj.namespace(), obj.meta().name.clone()) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(Error::invalid_source(format!(
            "{} without namespace or name cannot be written",
            K::kind(&())
        ))),
    }
}

#[async_trait]
impl<K: ClusterResource> ClusterClient<K> for KubeClusterClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<()> {
        let (namespace, _) = identity(obj)?;
        self.api::<K>(&namespace)
            .create(&Self::post_params(), obj)
            .await?;
        Ok(())
    }

    async fn update(&self, obj: &K) -> Result<()> {
        let (namespace, name) = identity(obj)?;
        self.api::<K>(&namespace)
            .replace(&name, &Self::post_params(), obj)
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
