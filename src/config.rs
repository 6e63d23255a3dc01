//! Operator configuration, read from the environment at startup

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::queue::{default_controller_rate_limiter, MaxOfRateLimiter};

/// Controllers the operator can run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerKind {
    /// Service → Ingress, gated by the `ingress/http` annotation
    ServiceIngress,
    /// App → Deployment, Service, Ingress
    App,
}

impl FromStr for ControllerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "service-ingress" => Ok(ControllerKind::ServiceIngress),
            "app" => Ok(ControllerKind::App),
            other => Err(Error::config(format!(
                "Unknown controller '{}': must be one of: service-ingress, app",
                other
            ))),
        }
    }
}

/// Runtime configuration shared by all controllers
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Workers per controller
    pub workers: usize,
    /// Requeues of a failing key before it is dropped
    pub max_retries: u32,
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    /// Port of the metrics and health endpoint
    pub metrics_port: u16,
    /// Delete derived resources ourselves when their source disappears
    /// instead of relying on owner-reference garbage collection
    pub explicit_cleanup: bool,
    /// Controllers to start
    pub controllers: Vec<ControllerKind>,
    /// Host used by generated Ingress rules unless the source sets one
    pub ingress_host: String,
    /// `ingressClassName` of generated Ingresses
    pub ingress_class: Option<String>,
    /// First retry delay of a failing key
    pub retry_base_delay: Duration,
    /// Upper bound of the per-key retry delay
    pub retry_max_delay: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_retries: 10,
            namespace: None,
            metrics_port: 8080,
            explicit_cleanup: false,
            controllers: vec![ControllerKind::ServiceIngress, ControllerKind::App],
            ingress_host: "example.com".to_string(),
            ingress_class: None,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_secs(1000),
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let controllers = match non_empty("OPERATOR_CONTROLLERS") {
            Some(list) => list
                .split(',')
                .filter(|name| !name.trim().is_empty())
                .map(ControllerKind::from_str)
                .collect::<Result<Vec<_>>>()?,
            None => defaults.controllers,
        };

        let config = Self {
            workers: parse(&lookup, "OPERATOR_WORKERS", defaults.workers)?,
            max_retries: parse(&lookup, "OPERATOR_MAX_RETRIES", defaults.max_retries)?,
            namespace: non_empty("OPERATOR_NAMESPACE"),
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            explicit_cleanup: parse(
                &lookup,
                "OPERATOR_EXPLICIT_CLEANUP",
                defaults.explicit_cleanup,
            )?,
            controllers,
            ingress_host: non_empty("INGRESS_HOST").unwrap_or(defaults.ingress_host),
            ingress_class: non_empty("INGRESS_CLASS"),
            retry_base_delay: Duration::from_millis(parse(
                &lookup,
                "RETRY_BASE_DELAY_MS",
                5u64,
            )?),
            retry_max_delay: Duration::from_secs(parse(&lookup, "RETRY_MAX_DELAY_SECS", 1000u64)?),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("OPERATOR_WORKERS must be at least 1"));
        }
        if self.controllers.is_empty() {
            return Err(Error::config("OPERATOR_CONTROLLERS must name at least one controller"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::config(
                "RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_SECS",
            ));
        }
        Ok(())
    }

    /// Whether `kind` should be started
    pub fn runs(&self, kind: ControllerKind) -> bool {
        self.controllers.contains(&kind)
    }

    /// Rate limiter for a controller's work queue
    pub fn rate_limiter(&self) -> MaxOfRateLimiter {
        default_controller_rate_limiter(self.retry_base_delay, self.retry_max_delay)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, raw, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<OperatorConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.namespace, None);
        assert!(!config.explicit_cleanup);
        assert!(config.runs(ControllerKind::ServiceIngress));
        assert!(config.runs(ControllerKind::App));
        assert_eq!(config.ingress_host, "example.com");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("OPERATOR_WORKERS", "2"),
            ("OPERATOR_MAX_RETRIES", "3"),
            ("OPERATOR_NAMESPACE", "apps"),
            ("OPERATOR_EXPLICIT_CLEANUP", "true"),
            ("OPERATOR_CONTROLLERS", "app"),
            ("INGRESS_CLASS", "nginx"),
            ("RETRY_BASE_DELAY_MS", "100"),
        ])
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert!(config.explicit_cleanup);
        assert_eq!(config.controllers, vec![ControllerKind::App]);
        assert_eq!(config.ingress_class.as_deref(), Some("nginx"));
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for vars in [
            vec![("OPERATOR_WORKERS", "many")],
            vec![("OPERATOR_WORKERS", "0")],
            vec![("OPERATOR_EXPLICIT_CLEANUP", "yes")],
            vec![("OPERATOR_CONTROLLERS", "service-ingress,cronjob")],
            vec![("RETRY_BASE_DELAY_MS", "5000"), ("RETRY_MAX_DELAY_SECS", "1")],
        ] {
            let err = config_from(&vars).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{:?} should be rejected", vars);
        }
    }
}
