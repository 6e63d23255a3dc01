//! Adapters between the reconciliation core and the Kubernetes API
//!
//! The core only talks to the two traits defined here: [`ObjectCache`] for
//! reads and [`ClusterClient`] for writes. The kube-backed implementations
//! live next to them.

mod cluster_client;
mod watch_cache;

pub use cluster_client::*;
pub use watch_cache::*;

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

/// Namespaced Kubernetes object the operator can watch, cache and write
pub trait ClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + PartialEq
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + PartialEq
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}
