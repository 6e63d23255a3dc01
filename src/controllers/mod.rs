//! Controllers wiring watch caches, a work queue and a reconciler together
//!
//! Each controller watches its source kind plus the kinds it derives,
//! turns every change into a `namespace/name` key and lets a pool of
//! workers reconcile those keys.

mod app_controller;
mod service_ingress_controller;
mod worker;

pub use app_controller::run as run_app_controller;
pub use service_ingress_controller::run as run_service_ingress_controller;
pub use worker::WorkerPool;

use std::sync::Arc;

use kube::api::ListParams;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::adapters::{ClusterResource, Informer, KubeClusterClient, Notification};
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::keys;
use crate::queue::WorkQueue;
use crate::reconcilers::CleanupPolicy;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator configuration
    pub config: OperatorConfig,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self { client, config }
    }

    /// Api for `K` scoped to the watched namespace, or all namespaces
    pub fn api<K: ClusterResource>(&self) -> Api<K> {
        match &self.config.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// Writer for derived resources
    pub fn cluster_client(&self) -> Arc<KubeClusterClient> {
        Arc::new(KubeClusterClient::new(self.client.clone()))
    }

    /// How derived resources of a deleted `S` are removed
    pub fn cleanup_policy<S: ClusterResource>(&self) -> CleanupPolicy<S> {
        if self.config.explicit_cleanup {
            CleanupPolicy::Explicit(self.cluster_client())
        } else {
            CleanupPolicy::OwnerReferences
        }
    }

    pub fn watcher_config(&self) -> watcher::Config {
        watcher::Config::default()
    }

    /// Fail fast when `K` cannot be listed, e.g. a missing CRD or RBAC rule
    pub async fn verify_api<K: ClusterResource>(&self) -> Result<()> {
        if let Err(e) = self.api::<K>().list(&ListParams::default().limit(1)).await {
            error!(kind = %K::kind(&()), error = %e, "Cannot list resource");
            return Err(e.into());
        }
        Ok(())
    }
}

/// Event handler enqueueing the key of every changed source object
fn enqueue_source<S: ClusterResource>(
    queue: Arc<WorkQueue>,
) -> impl FnMut(Notification<'_, S>) + Send + 'static {
    move |event: Notification<'_, S>| {
        if let Some(key) = keys::source_key(&event) {
            queue.add(key);
        }
    }
}

/// Event handler enqueueing keys for derived objects controlled by an
/// `owner_kind` object
fn enqueue_derived<K: ClusterResource>(
    queue: Arc<WorkQueue>,
    owner_kind: String,
) -> impl FnMut(Notification<'_, K>) + Send + 'static {
    move |event: Notification<'_, K>| {
        if let Some(key) = keys::derived_key(&event, &owner_kind) {
            queue.add(key);
        }
    }
}

/// Watch the source kind, enqueueing the key of every changed object
fn spawn_source_watch<S: ClusterResource>(
    watches: &mut JoinSet<()>,
    informer: Informer<S>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    watches.spawn(informer.run(shutdown, enqueue_source(queue)));
}

/// Watch a derived kind, enqueueing keys for objects controlled by an
/// `owner_kind` object
fn spawn_derived_watch<K: ClusterResource>(
    watches: &mut JoinSet<()>,
    informer: Informer<K>,
    owner_kind: String,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    watches.spawn(informer.run(shutdown, enqueue_derived(queue, owner_kind)));
}

/// Wait for every watch task to stop
async fn join_watches(mut watches: JoinSet<()>) {
    while let Some(result) = watches.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Watch task failed");
        }
    }
}
