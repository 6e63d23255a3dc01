//! Create/update/delete decision for one derived resource type

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::{Dependent, Outcome};
use crate::adapters::{ClusterClient, ClusterResource, ObjectCache};
use crate::error::{Error, Result};
use crate::keys;
use crate::metrics;

/// Pure mapping from a source object to the desired shape of one derived
/// resource type.
pub trait DesiredState<S>: Send + Sync {
    type Derived: ClusterResource;

    /// Desired object, named and namespaced like `source`; `None` when the
    /// source does not ask for this resource.
    fn desired(&self, source: &S) -> Option<Self::Derived>;

    /// Copy the fields this builder controls from `desired` onto `live`,
    /// leaving everything the API server assigned alone.
    fn apply(&self, desired: &Self::Derived, live: &mut Self::Derived);
}

/// A derived resource kept in line with its source through the watch cache
/// and the cluster client.
pub struct DependentResource<S, B: DesiredState<S>> {
    kind: String,
    builder: B,
    cache: Arc<dyn ObjectCache<B::Derived>>,
    client: Arc<dyn ClusterClient<B::Derived>>,
    _source: PhantomData<fn(&S)>,
}

impl<S, B> DependentResource<S, B>
where
    S: ClusterResource,
    B: DesiredState<S>,
{
    pub fn new(
        builder: B,
        cache: Arc<dyn ObjectCache<B::Derived>>,
        client: Arc<dyn ClusterClient<B::Derived>>,
    ) -> Self {
        Self {
            kind: <B::Derived as Resource>::kind(&()).to_string(),
            builder,
            cache,
            client,
            _source: PhantomData,
        }
    }

    fn record(&self, outcome: Outcome) -> Outcome {
        if outcome.is_write() {
            metrics::DERIVED_OPERATIONS
                .with_label_values(&[&self.kind, outcome.as_str()])
                .inc();
        }
        outcome
    }
}

#[async_trait]
impl<S, B> Dependent<S> for DependentResource<S, B>
where
    S: ClusterResource,
    B: DesiredState<S> + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn sync(&self, source: &S) -> Result<Outcome> {
        let owner = source.controller_owner_ref(&()).ok_or_else(|| {
            Error::invalid_source(format!(
                "{} {:?} has no name or uid to own derived resources",
                S::kind(&()),
                keys::object_key(source)
            ))
        })?;
        let namespace = source.namespace().ok_or_else(|| {
            Error::invalid_source(format!("{} {} has no namespace", S::kind(&()), owner.name))
        })?;
        let name = owner.name.clone();

        let desired = self.builder.desired(source);
        let live = self.cache.get(&namespace, &name);

        let outcome = match (desired, live) {
            (Some(mut desired), None) => {
                desired.meta_mut().owner_references = Some(vec![owner]);
                self.client.create(&desired).await?;
                info!(kind = %self.kind, namespace = %namespace, name = %name, "Created derived resource");
                Outcome::Created
            }
            (Some(desired), Some(live)) => {
                if let Some(other) = keys::controller_of(live.as_ref()) {
                    if other.uid != owner.uid {
                        return Err(Error::OwnershipConflict {
                            kind: self.kind.clone(),
                            key: keys::key_for(&namespace, &name),
                        });
                    }
                }

                let mut next = live.as_ref().clone();
                self.builder.apply(&desired, &mut next);
                adopt(next.meta_mut(), owner);

                if next == *live {
                    debug!(kind = %self.kind, namespace = %namespace, name = %name, "Derived resource up to date");
                    Outcome::Unchanged
                } else {
                    self.client.update(&next).await?;
                    info!(kind = %self.kind, namespace = %namespace, name = %name, "Updated derived resource");
                    Outcome::Updated
                }
            }
            (None, Some(live)) => {
                if is_controlled_by(live.as_ref(), &owner) {
                    self.client.delete(&namespace, &name).await?;
                    info!(kind = %self.kind, namespace = %namespace, name = %name, "Deleted derived resource");
                    Outcome::Deleted
                } else {
                    debug!(
                        kind = %self.kind,
                        namespace = %namespace,
                        name = %name,
                        "Not wanted but not controlled by this source, leaving it alone"
                    );
                    Outcome::Unchanged
                }
            }
            (None, None) => Outcome::Unchanged,
        };

        Ok(self.record(outcome))
    }

    async fn cleanup(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(live) = self.cache.get(namespace, name) else {
            return Ok(Outcome::Unchanged);
        };

        let source_kind = S::kind(&());
        let ours = keys::controller_of(live.as_ref())
            .is_some_and(|owner| owner.kind == source_kind && owner.name == name);
        if !ours {
            return Ok(Outcome::Unchanged);
        }

        self.client.delete(namespace, name).await?;
        info!(kind = %self.kind, namespace = %namespace, name = %name, "Deleted derived resource of missing source");
        Ok(self.record(Outcome::Deleted))
    }
}

/// Whether `obj`'s controller owner is exactly `owner`
fn is_controlled_by<K: Resource>(obj: &K, owner: &OwnerReference) -> bool {
    keys::controller_of(obj).is_some_and(|controller| controller.uid == owner.uid)
}

/// Make `owner` the controller of an object that has none
fn adopt(meta: &mut ObjectMeta, owner: OwnerReference) {
    let owners = meta.owner_references.get_or_insert_with(Vec::new);
    if !owners.iter().any(|existing| existing.controller == Some(true)) {
        owners.push(owner);
    }
}

/// Add `desired` labels to `live`, keeping labels set by others
pub(crate) fn merge_labels(desired: &ObjectMeta, live: &mut ObjectMeta) {
    merge_map(desired.labels.as_ref(), &mut live.labels);
}

pub(crate) fn merge_map(
    desired: Option<&BTreeMap<String, String>>,
    live: &mut Option<BTreeMap<String, String>>,
) {
    let Some(desired) = desired.filter(|labels| !labels.is_empty()) else {
        return;
    };
    let live = live.get_or_insert_with(BTreeMap::new);
    for (key, value) in desired {
        if live.get(key) != Some(value) {
            live.insert(key.clone(), value.clone());
        }
    }
}
