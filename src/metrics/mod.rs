//! Prometheus metrics for the App Operator
//!
//! This module exposes metrics for monitoring operator health, reconcile
//! throughput and work queue pressure.

mod prometheus;

pub use prometheus::*;
