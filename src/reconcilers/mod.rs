//! Reconcilers for source objects and the resources derived from them
//!
//! This module contains the reconcile state machine shared by all
//! controllers. For one key it:
//! - Resolves the source object from the watch cache
//! - Walks the declared derived resources in order, creating, updating or
//!   deleting each so it matches what the source asks for
//! - Optionally cleans up after a source that no longer exists
//!
//! The desired shape of each derived resource comes from a pure builder in
//! [`app`] or [`service_ingress`].

pub mod app;
mod dependent;
mod ingress;
pub mod service_ingress;

pub use dependent::{DependentResource, DesiredState};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ClusterClient, ClusterResource, ObjectCache};
use crate::error::{Error, Result};
use crate::keys;
use crate::metrics;

/// Label stamped on every derived resource
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "app-operator";

/// What a reconcile step did to one derived resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "create",
            Outcome::Updated => "update",
            Outcome::Deleted => "delete",
            Outcome::Unchanged => "none",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

/// One derived resource type maintained on behalf of a source of type `S`
#[async_trait]
pub trait Dependent<S>: Send + Sync {
    /// Kind of the derived resource
    fn kind(&self) -> &str;

    /// Bring the derived resource in line with `source`
    async fn sync(&self, source: &S) -> Result<Outcome>;

    /// Delete the derived resource of a source that no longer exists
    async fn cleanup(&self, namespace: &str, name: &str) -> Result<Outcome>;
}

/// Entry point used by the worker pool
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Kind of the source objects, used in logs and metrics
    fn kind(&self) -> &str;

    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// How derived resources of a deleted source are removed
pub enum CleanupPolicy<S> {
    /// The API server's garbage collector follows the owner references
    OwnerReferences,
    /// Delete them here; the client confirms the source is really gone
    Explicit(Arc<dyn ClusterClient<S>>),
}

/// Reconciles one source kind against its declared derived resources
pub struct Reconciler<S> {
    kind: String,
    source: Arc<dyn ObjectCache<S>>,
    dependents: Vec<Arc<dyn Dependent<S>>>,
    cleanup: CleanupPolicy<S>,
}

impl<S: ClusterResource> Reconciler<S> {
    pub fn new(source: Arc<dyn ObjectCache<S>>, cleanup: CleanupPolicy<S>) -> Self {
        Self {
            kind: S::kind(&()).to_string(),
            source,
            dependents: Vec::new(),
            cleanup,
        }
    }

    /// Declare the next derived resource. Resources are synced in the order
    /// they are declared and cleaned up in reverse.
    pub fn with_dependent(mut self, dependent: impl Dependent<S> + 'static) -> Self {
        self.dependents.push(Arc::new(dependent));
        self
    }

    /// Run one reconcile pass for `key`, returning one outcome per step taken.
    ///
    /// The first failing step aborts the pass; every step is idempotent so
    /// the next pass picks up where this one stopped.
    pub async fn sync(&self, key: &str) -> Result<Vec<Outcome>> {
        let (namespace, name) = keys::split_key(key)?;

        if !self.source.has_synced() {
            return Err(Error::CacheSync(format!("{} cache has not synced", self.kind)));
        }

        let Some(source) = self.source.get(namespace, name) else {
            return self.source_missing(namespace, name).await;
        };

        let mut outcomes = Vec::with_capacity(self.dependents.len());
        for dependent in &self.dependents {
            let outcome = dependent.sync(&source).await.map_err(|e| {
                warn!(
                    key = %key,
                    dependent = dependent.kind(),
                    error = %e,
                    "Derived resource step failed, aborting pass"
                );
                e
            })?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn source_missing(&self, namespace: &str, name: &str) -> Result<Vec<Outcome>> {
        let client = match &self.cleanup {
            CleanupPolicy::OwnerReferences => {
                debug!(
                    kind = %self.kind,
                    namespace = %namespace,
                    name = %name,
                    "Source not found, leaving derived resources to garbage collection"
                );
                return Ok(Vec::new());
            }
            CleanupPolicy::Explicit(client) => client,
        };

        // The cache may lag behind a recreate; only the API server is
        // authoritative before deleting anything.
        if client.get(namespace, name).await?.is_some() {
            debug!(
                kind = %self.kind,
                namespace = %namespace,
                name = %name,
                "Source missing from cache but still exists, skipping cleanup"
            );
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(self.dependents.len());
        for dependent in self.dependents.iter().rev() {
            outcomes.push(dependent.cleanup(namespace, name).await?);
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl<S: ClusterResource> Reconcile for Reconciler<S> {
    fn kind(&self) -> &str {
        &self.kind
    }

    #[instrument(skip(self), fields(kind = %self.kind))]
    async fn reconcile(&self, key: &str) -> Result<()> {
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[&self.kind])
            .start_timer();
        metrics::RECONCILIATIONS.with_label_values(&[&self.kind]).inc();

        let outcomes = self.sync(key).await?;
        let writes = outcomes.iter().filter(|outcome| outcome.is_write()).count();
        if writes > 0 {
            info!(key = %key, writes, "Reconciled {}", self.kind);
        } else {
            debug!(key = %key, "{} already up to date", self.kind);
        }
        Ok(())
    }
}
