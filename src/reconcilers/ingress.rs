//! Ingress shape shared by the Service and App builders

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::ObjectMeta;

use super::dependent::merge_labels;

/// Everything an HTTP Ingress routing `/` to one Service port needs
pub(crate) struct HttpRoute<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub host: &'a str,
    pub service: &'a str,
    pub port: i32,
    pub class: Option<&'a str>,
    pub labels: BTreeMap<String, String>,
}

pub(crate) fn http_ingress(route: HttpRoute<'_>) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(route.name.to_string()),
            namespace: Some(route.namespace.to_string()),
            labels: Some(route.labels),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: route.class.map(str::to_string),
            rules: Some(vec![IngressRule {
                host: Some(route.host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: route.service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(route.port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Managed fields: labels, rules, and the class when one is configured
pub(crate) fn apply_ingress(desired: &Ingress, live: &mut Ingress) {
    merge_labels(&desired.metadata, &mut live.metadata);

    let Some(want) = desired.spec.as_ref() else {
        return;
    };
    let spec = live.spec.get_or_insert_with(IngressSpec::default);
    if spec.rules != want.rules {
        spec.rules = want.rules.clone();
    }
    if want.ingress_class_name.is_some() && spec.ingress_class_name != want.ingress_class_name {
        spec.ingress_class_name = want.ingress_class_name.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(host: &str) -> Ingress {
        http_ingress(HttpRoute {
            namespace: "default",
            name: "foo",
            host,
            service: "foo",
            port: 80,
            class: None,
            labels: BTreeMap::from([("app".to_string(), "foo".to_string())]),
        })
    }

    #[test]
    fn routes_root_prefix_to_service_port() {
        let ingress = route("foo.example.com");
        let rule = &ingress.spec.as_ref().unwrap().rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("foo.example.com"));

        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "foo");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
    }

    #[test]
    fn apply_keeps_foreign_labels_and_class() {
        let desired = route("foo.example.com");
        let mut live = route("old.example.com");
        live.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("team".to_string(), "web".to_string());
        live.spec.as_mut().unwrap().ingress_class_name = Some("nginx".to_string());

        apply_ingress(&desired, &mut live);

        let labels = live.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("web"));
        assert_eq!(labels.get("app").map(String::as_str), Some("foo"));
        let spec = live.spec.as_ref().unwrap();
        assert_eq!(spec.rules, desired.spec.as_ref().unwrap().rules);
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
    }
}
