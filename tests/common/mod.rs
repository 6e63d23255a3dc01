//! In-memory cluster used by the integration tests
//!
//! A [`FakeCluster`] plays both the watch cache and the API server for one
//! resource kind. Writes land in the same map reads come from, so a second
//! reconcile pass observes the first pass's writes.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use app_operator::adapters::{ClusterClient, ClusterResource, ObjectCache};
use app_operator::crd::{App, AppSpec};
use app_operator::reconcilers::service_ingress::INGRESS_ANNOTATION;
use app_operator::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;

/// A client call observed by a [`FakeCluster`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Get(String),
    Create(String),
    Update(String),
    Delete(String),
}

impl Call {
    pub fn is_write(&self) -> bool {
        !matches!(self, Call::Get(_))
    }
}

type Defaulter<K> = Box<dyn Fn(&mut K) + Send + Sync>;

struct State<K> {
    objects: BTreeMap<String, Arc<K>>,
    calls: Vec<Call>,
    fail_writes: Option<u16>,
    synced: bool,
    resource_version: u64,
}

pub struct FakeCluster<K> {
    state: Mutex<State<K>>,
    defaulter: Option<Defaulter<K>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn object_key<K: Resource>(obj: &K) -> String {
    key(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {}", reason),
        reason: reason.to_string(),
        code,
    }))
}

impl<K: ClusterResource> FakeCluster<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Cluster that runs `defaulter` on every stored write, like API server
    /// defaulting and admission
    pub fn with_defaulter(defaulter: impl Fn(&mut K) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self::build(Some(Box::new(defaulter))))
    }

    fn build(defaulter: Option<Defaulter<K>>) -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                fail_writes: None,
                synced: true,
                resource_version: 0,
            }),
            defaulter,
        }
    }

    /// Store `obj` directly, as if another actor had written it
    pub fn put(&self, obj: K) {
        let key = object_key(&obj);
        self.state.lock().objects.insert(key, Arc::new(obj));
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.state.lock().objects.remove(&key(namespace, name));
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.state
            .lock()
            .objects
            .get(&key(namespace, name))
            .map(|obj| obj.as_ref().clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_write).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make every following write fail with HTTP status `code`
    pub fn fail_writes(&self, code: u16) {
        self.state.lock().fail_writes = Some(code);
    }

    pub fn set_synced(&self, synced: bool) {
        self.state.lock().synced = synced;
    }

    fn store(&self, state: &mut State<K>, obj: &K) -> String {
        let mut obj = obj.clone();
        if let Some(defaulter) = &self.defaulter {
            defaulter(&mut obj);
        }
        state.resource_version += 1;
        obj.meta_mut().resource_version = Some(state.resource_version.to_string());
        let key = object_key(&obj);
        state.objects.insert(key.clone(), Arc::new(obj));
        key
    }
}

impl<K: ClusterResource> ObjectCache<K> for FakeCluster<K> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.state.lock().objects.get(&key(namespace, name)).cloned()
    }

    fn has_synced(&self) -> bool {
        self.state.lock().synced
    }
}

#[async_trait]
impl<K: ClusterResource> ClusterClient<K> for FakeCluster<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Get(key(namespace, name)));
        Ok(state
            .objects
            .get(&key(namespace, name))
            .map(|obj| obj.as_ref().clone()))
    }

    async fn create(&self, obj: &K) -> Result<()> {
        let mut state = self.state.lock();
        let key = object_key(obj);
        state.calls.push(Call::Create(key.clone()));
        if let Some(code) = state.fail_writes {
            return Err(api_error(code, "InternalError"));
        }
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        self.store(&mut state, obj);
        Ok(())
    }

    async fn update(&self, obj: &K) -> Result<()> {
        let mut state = self.state.lock();
        let key = object_key(obj);
        state.calls.push(Call::Update(key.clone()));
        if let Some(code) = state.fail_writes {
            return Err(api_error(code, "InternalError"));
        }
        if !state.objects.contains_key(&key) {
            return Err(api_error(404, "NotFound"));
        }
        self.store(&mut state, obj);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Delete(key(namespace, name)));
        if let Some(code) = state.fail_writes {
            return Err(api_error(code, "InternalError"));
        }
        state.objects.remove(&key(namespace, name));
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const NAMESPACE: &str = "default";

pub fn metadata(name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(uid.to_string()),
        ..Default::default()
    }
}

/// Service named `name` listening on `port`, optionally annotated for an
/// Ingress
pub fn service(name: &str, uid: &str, annotated: bool, port: i32) -> Service {
    let mut metadata = metadata(name, uid);
    if annotated {
        metadata.annotations = Some(BTreeMap::from([(
            INGRESS_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
    }
    Service {
        metadata,
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn app(name: &str, uid: &str, enable_service: bool, enable_ingress: bool) -> App {
    let mut app = App::new(
        name,
        AppSpec {
            image: "nginx:1.27".to_string(),
            replicas: 2,
            port: 8080,
            enable_service,
            enable_ingress,
            host: None,
        },
    );
    app.metadata = metadata(name, uid);
    app
}

/// Controller owner reference pointing at an object of `kind`
pub fn controller_ref(kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Uid of the controller owner of `obj`, if any
pub fn controller_uid<K: Resource>(obj: &K) -> Option<String> {
    obj.owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.uid.clone())
}
