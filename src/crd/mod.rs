//! Custom Resource Definitions for the App Operator

mod app;

pub use app::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&App::crd())?])
}
