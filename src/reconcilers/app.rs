//! App → Deployment, Service and Ingress builders
//!
//! Every derived resource carries the App's name and namespace. Pods are
//! selected through the `app: <name>` label.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::dependent::{merge_labels, merge_map};
use super::ingress::{apply_ingress, http_ingress, HttpRoute};
use super::{DesiredState, MANAGED_BY, MANAGED_BY_LABEL};
use crate::config::OperatorConfig;
use crate::crd::App;

/// Port the App Service listens on
pub const SERVICE_PORT: i32 = 80;

const SERVICE_PORT_NAME: &str = "http";

fn pod_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn object_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = pod_labels(name);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

fn metadata(app: &App) -> Option<ObjectMeta> {
    let name = app.metadata.name.clone()?;
    Some(ObjectMeta {
        labels: Some(object_labels(&name)),
        namespace: Some(app.namespace()?),
        name: Some(name),
        ..Default::default()
    })
}

/// Deployment running the App's image; always wanted
#[derive(Clone, Debug, Default)]
pub struct AppDeployment;

impl AppDeployment {
    fn container(app: &App, name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(app.spec.image.clone()),
            ports: Some(vec![ContainerPort {
                container_port: app.spec.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

impl DesiredState<App> for AppDeployment {
    type Derived = Deployment;

    fn desired(&self, app: &App) -> Option<Deployment> {
        let metadata = metadata(app)?;
        let name = metadata.name.clone()?;

        Some(Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas: Some(app.spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(pod_labels(&name)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels(&name)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Self::container(app, &name)],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Replicas, pod labels and the App's container. The selector is
    /// immutable once created and is never touched.
    fn apply(&self, desired: &Deployment, live: &mut Deployment) {
        merge_labels(&desired.metadata, &mut live.metadata);

        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let spec = live.spec.get_or_insert_with(DeploymentSpec::default);
        if spec.replicas != want.replicas {
            spec.replicas = want.replicas;
        }

        let template = &mut spec.template;
        if let Some(labels) = want
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.as_ref())
        {
            let meta = template.metadata.get_or_insert_with(ObjectMeta::default);
            merge_map(Some(labels), &mut meta.labels);
        }

        let Some(wanted) = want
            .template
            .spec
            .as_ref()
            .and_then(|pod| pod.containers.first())
        else {
            return;
        };
        let pod = template.spec.get_or_insert_with(PodSpec::default);
        match pod.containers.iter_mut().find(|c| c.name == wanted.name) {
            Some(container) => {
                if container.image != wanted.image {
                    container.image = wanted.image.clone();
                }
                if container.ports != wanted.ports {
                    container.ports = wanted.ports.clone();
                }
            }
            None => pod.containers.push(wanted.clone()),
        }
    }
}

/// ClusterIP Service in front of the App's pods; wanted with `enableService`
#[derive(Clone, Debug, Default)]
pub struct AppService;

impl DesiredState<App> for AppService {
    type Derived = Service;

    fn desired(&self, app: &App) -> Option<Service> {
        if !app.spec.enable_service {
            return None;
        }
        let metadata = metadata(app)?;
        let name = metadata.name.clone()?;

        Some(Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(pod_labels(&name)),
                ports: Some(vec![ServicePort {
                    name: Some(SERVICE_PORT_NAME.to_string()),
                    port: SERVICE_PORT,
                    target_port: Some(IntOrString::Int(app.spec.port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Selector, ports and type. `clusterIP` and friends stay with the
    /// API server.
    fn apply(&self, desired: &Service, live: &mut Service) {
        merge_labels(&desired.metadata, &mut live.metadata);

        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let spec = live.spec.get_or_insert_with(ServiceSpec::default);
        if spec.selector != want.selector {
            spec.selector = want.selector.clone();
        }
        if spec.type_ != want.type_ {
            spec.type_ = want.type_.clone();
        }

        match (spec.ports.as_mut(), want.ports.as_ref()) {
            // Keep server-assigned fields such as nodePort on matching ports
            (Some(live_ports), Some(want_ports)) if live_ports.len() == want_ports.len() => {
                for (live_port, want_port) in live_ports.iter_mut().zip(want_ports) {
                    if live_port.name != want_port.name {
                        live_port.name = want_port.name.clone();
                    }
                    if live_port.port != want_port.port {
                        live_port.port = want_port.port;
                    }
                    if live_port.target_port != want_port.target_port {
                        live_port.target_port = want_port.target_port.clone();
                    }
                    if live_port.protocol != want_port.protocol {
                        live_port.protocol = want_port.protocol.clone();
                    }
                }
            }
            _ => spec.ports = want.ports.clone(),
        }
    }
}

/// Ingress routing to the App Service; wanted only with both `enableService`
/// and `enableIngress`, since an Ingress without its Service routes nowhere
#[derive(Clone, Debug)]
pub struct AppIngress {
    host: String,
    class: Option<String>,
}

impl AppIngress {
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

impl DesiredState<App> for AppIngress {
    type Derived = Ingress;

    fn desired(&self, app: &App) -> Option<Ingress> {
        if !(app.spec.enable_service && app.spec.enable_ingress) {
            return None;
        }
        let namespace = app.namespace()?;
        let name = app.metadata.name.as_deref()?;
        let host = app
            .spec
            .host
            .as_deref()
            .filter(|host| !host.is_empty())
            .unwrap_or(&self.host);

        Some(http_ingress(HttpRoute {
            namespace: &namespace,
            name,
            host,
            service: name,
            port: SERVICE_PORT,
            class: self.class.as_deref(),
            labels: object_labels(name),
        }))
    }

    fn apply(&self, desired: &Ingress, live: &mut Ingress) {
        apply_ingress(desired, live);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AppSpec;

    fn app(enable_service: bool, enable_ingress: bool) -> App {
        let mut app = App::new(
            "web",
            AppSpec {
                image: "nginx:1.27".to_string(),
                replicas: 2,
                port: 8080,
                enable_service,
                enable_ingress,
                host: None,
            },
        );
        app.metadata.namespace = Some("default".to_string());
        app
    }

    #[test]
    fn deployment_runs_image_with_pod_selector() {
        let deployment = AppDeployment.desired(&app(false, false)).unwrap();
        let spec = deployment.spec.unwrap();

        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.selector.match_labels, Some(pod_labels("web")));
        let containers = spec.template.spec.unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].image.as_deref(), Some("nginx:1.27"));
        assert_eq!(containers[0].ports.as_ref().unwrap()[0].container_port, 8080);
    }

    #[test]
    fn deployment_apply_keeps_selector_and_sidecars() {
        let desired = AppDeployment.desired(&app(false, false)).unwrap();
        let mut live = desired.clone();
        {
            let spec = live.spec.as_mut().unwrap();
            spec.replicas = Some(5);
            spec.selector.match_labels = Some(BTreeMap::from([(
                "legacy".to_string(),
                "true".to_string(),
            )]));
            let pod = spec.template.spec.as_mut().unwrap();
            pod.containers[0].image = Some("nginx:1.25".to_string());
            pod.containers.push(Container {
                name: "proxy".to_string(),
                ..Default::default()
            });
        }

        AppDeployment.apply(&desired, &mut live);

        let spec = live.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.unwrap().get("legacy").map(String::as_str),
            Some("true")
        );
        let containers = spec.template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].image.as_deref(), Some("nginx:1.27"));
    }

    #[test]
    fn service_only_with_enable_service() {
        assert!(AppService.desired(&app(false, true)).is_none());

        let service = AppService.desired(&app(true, false)).unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.selector, Some(pod_labels("web")));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn service_apply_keeps_cluster_ip() {
        let desired = AppService.desired(&app(true, false)).unwrap();
        let mut live = desired.clone();
        live.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.12".to_string());
        let before = live.clone();

        AppService.apply(&desired, &mut live);
        assert_eq!(live, before);
    }

    #[test]
    fn ingress_requires_service() {
        let builder = AppIngress::new("example.com", None);
        assert!(builder.desired(&app(false, true)).is_none());
        assert!(builder.desired(&app(true, false)).is_none());
        assert!(builder.desired(&app(true, true)).is_some());
    }

    #[test]
    fn ingress_host_prefers_app_host() {
        let builder = AppIngress::new("example.com", None);
        let mut source = app(true, true);
        let host_of = |ingress: Ingress| {
            ingress.spec.unwrap().rules.unwrap()[0]
                .host
                .clone()
                .unwrap_or_default()
        };

        assert_eq!(host_of(builder.desired(&source).unwrap()), "example.com");
        source.spec.host = Some("web.apps.test".to_string());
        assert_eq!(host_of(builder.desired(&source).unwrap()), "web.apps.test");
    }
}
