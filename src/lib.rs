//! App Operator
//!
//! Level-triggered controllers that keep derived Kubernetes resources in
//! line with the objects they are derived from:
//! - Services annotated with `ingress/http` get an Ingress
//! - `App` custom resources get a Deployment, and optionally a Service and
//!   an Ingress

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod queue;
pub mod reconcilers;

pub use error::{Error, Result};
