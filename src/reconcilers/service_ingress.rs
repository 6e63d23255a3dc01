//! Service → Ingress builder
//!
//! A Service carrying the [`INGRESS_ANNOTATION`] gets an Ingress of the same
//! name routing `/` on the configured host to the Service's first port.
//! The annotation's value is ignored; presence alone enables the Ingress.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use super::ingress::{apply_ingress, http_ingress, HttpRoute};
use super::{DesiredState, MANAGED_BY, MANAGED_BY_LABEL};
use crate::config::OperatorConfig;

/// Annotation on a Service requesting an Ingress
pub const INGRESS_ANNOTATION: &str = "ingress/http";

/// Backend port used when the Service declares none
const FALLBACK_PORT: i32 = 80;

/// Whether `service` asks for an Ingress
pub fn ingress_enabled(service: &Service) -> bool {
    service.annotations().contains_key(INGRESS_ANNOTATION)
}

/// Builds the Ingress of an annotated Service
#[derive(Clone, Debug)]
pub struct ServiceIngress {
    host: String,
    class: Option<String>,
}

impl ServiceIngress {
    pub fn new(host: impl Into<String>, class: Option<String>) -> Self {
        Self {
            host: host.into(),
            class,
        }
    }

    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(config.ingress_host.clone(), config.ingress_class.clone())
    }
}

fn backend_port(service: &Service) -> i32 {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.port)
        .unwrap_or(FALLBACK_PORT)
}

impl DesiredState<Service> for ServiceIngress {
    type Derived = Ingress;

    fn desired(&self, service: &Service) -> Option<Ingress> {
        if !ingress_enabled(service) {
            return None;
        }
        let namespace = service.namespace()?;
        let name = service.metadata.name.as_deref()?;

        Some(http_ingress(HttpRoute {
            namespace: &namespace,
            name,
            host: &self.host,
            service: name,
            port: backend_port(service),
            class: self.class.as_deref(),
            labels: BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]),
        }))
    }

    fn apply(&self, desired: &Ingress, live: &mut Ingress) {
        apply_ingress(desired, live);
    }
}
