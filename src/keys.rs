//! Work queue keys and the translation of watch events into keys
//!
//! A key is `<namespace>/<name>` with exactly one separator. Handlers call
//! [`source_key`] and [`derived_key`] from the watch task and enqueue whatever
//! they return; all diffing happens later in the reconciler.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::adapters::Notification;
use crate::error::{Error, Result};

/// Build the key of a namespaced object
pub fn key_for(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Key of an object, or `None` if it lacks a namespace or name
pub fn object_key<K: Resource>(obj: &K) -> Option<String> {
    let meta = obj.meta();
    match (meta.namespace.as_deref(), meta.name.as_deref()) {
        (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
            Some(key_for(namespace, name))
        }
        _ => None,
    }
}

/// Split a key into namespace and name.
///
/// Anything other than two non-empty halves around a single `/` is a
/// permanent [`Error::MalformedKey`].
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace, name))
        }
        _ => Err(Error::MalformedKey(key.to_string())),
    }
}

/// The owner reference flagged as managing controller, if any
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
}

/// Key to enqueue for any change of a source object
pub fn source_key<S: Resource>(event: &Notification<'_, S>) -> Option<String> {
    let key = object_key(event.object());
    if key.is_none() {
        debug!("Ignoring source event for object without namespace or name");
    }
    key
}

/// Key to enqueue for a change of a derived object, if it is ours.
///
/// Only objects whose controller owner has kind `owner_kind` are considered.
/// A deletion enqueues the derived object's own key so the source is resynced
/// and the object recreated if still desired. Any other change enqueues the
/// owner so edits to managed fields are reverted.
pub fn derived_key<K: Resource>(event: &Notification<'_, K>, owner_kind: &str) -> Option<String> {
    let obj = event.object();
    let owner = controller_of(obj).filter(|owner| owner.kind == owner_kind)?;

    match event {
        Notification::Deleted(_) => object_key(obj),
        Notification::Applied(_) => {
            let namespace = obj.namespace()?;
            Some(key_for(&namespace, &owner.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::api::ObjectMeta;

    use super::*;

    fn owner(kind: &str, name: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{}-uid", name),
            controller,
            block_owner_deletion: Some(true),
        }
    }

    fn ingress(name: &str, owners: Vec<OwnerReference>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn split_key_accepts_namespace_and_name() {
        assert_eq!(split_key("default/foo").unwrap(), ("default", "foo"));
    }

    #[test]
    fn split_key_rejects_malformed_keys() {
        for key in ["noSlash", "a/b/c", "/foo", "default/", "", "/"] {
            let err = split_key(key).unwrap_err();
            assert!(
                matches!(err, Error::MalformedKey(ref k) if k == key),
                "{:?} should be malformed",
                key
            );
        }
    }

    #[test]
    fn object_key_requires_namespace_and_name() {
        assert_eq!(
            object_key(&ingress("foo", vec![])).as_deref(),
            Some("default/foo")
        );

        let mut unnamed = ingress("foo", vec![]);
        unnamed.metadata.name = None;
        assert_eq!(object_key(&unnamed), None);
    }

    #[test]
    fn delete_of_owned_object_enqueues_its_own_key() {
        let obj = ingress("foo", vec![owner("Service", "foo", Some(true))]);
        assert_eq!(
            derived_key(&Notification::Deleted(&obj), "Service").as_deref(),
            Some("default/foo")
        );
    }

    #[test]
    fn delete_of_object_owned_by_other_kind_is_discarded() {
        let obj = ingress("foo", vec![owner("Deployment", "foo", Some(true))]);
        assert_eq!(derived_key(&Notification::Deleted(&obj), "Service"), None);
    }

    #[test]
    fn delete_without_controller_owner_is_discarded() {
        let unowned = ingress("foo", vec![]);
        assert_eq!(derived_key(&Notification::Deleted(&unowned), "Service"), None);

        // A plain owner reference does not make us the controller
        let referenced = ingress("foo", vec![owner("Service", "foo", None)]);
        assert_eq!(
            derived_key(&Notification::Deleted(&referenced), "Service"),
            None
        );
    }

    #[test]
    fn update_of_owned_object_enqueues_owner() {
        let obj = ingress("foo-web", vec![owner("App", "foo", Some(true))]);
        assert_eq!(
            derived_key(&Notification::Applied(&obj), "App").as_deref(),
            Some("default/foo")
        );
    }

    #[test]
    fn source_events_always_enqueue() {
        let obj = ingress("foo", vec![]);
        assert_eq!(
            source_key(&Notification::Applied(&obj)).as_deref(),
            Some("default/foo")
        );
        assert_eq!(
            source_key(&Notification::Deleted(&obj)).as_deref(),
            Some("default/foo")
        );
    }
}
