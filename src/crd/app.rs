//! App Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// App resource specification
///
/// An App always owns a Deployment. It also owns a Service when
/// `enableService` is set, and an Ingress when both `enableService` and
/// `enableIngress` are set. All three share the App's name and namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.operator.dev",
    version = "v1beta1",
    kind = "App",
    plural = "apps",
    singular = "app",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".spec.image"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Service", "type": "boolean", "jsonPath": ".spec.enableService"}"#,
    printcolumn = r#"{"name": "Ingress", "type": "boolean", "jsonPath": ".spec.enableIngress"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Container image
    pub image: String,

    /// Number of pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Port the container listens on
    #[serde(default = "default_port")]
    pub port: i32,

    /// Expose the pods through a ClusterIP Service
    #[serde(default)]
    pub enable_service: bool,

    /// Route external traffic to the Service; requires `enableService`
    #[serde(default)]
    pub enable_ingress: bool,

    /// Ingress host; the operator's default host when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    8080
}
