//! Error types for the App Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Work queue key that is not of the form `namespace/name`
    #[error("Malformed key '{0}': expected <namespace>/<name>")]
    MalformedKey(String),

    /// Source object that cannot own derived resources (no name or uid)
    #[error("Invalid source object: {0}")]
    InvalidSource(String),

    /// Derived object controlled by a different owner
    #[error("{kind} {key} is controlled by another owner")]
    OwnershipConflict { kind: String, key: String },

    /// Watch cache never reached its initial sync
    #[error("Cache sync failed: {0}")]
    CacheSync(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reconcile panicked
    #[error("Reconcile panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid source error
    pub fn invalid_source(msg: impl Into<String>) -> Self {
        Error::InvalidSource(msg.into())
    }

    /// HTTP status code of an API error, if any
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// The API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Optimistic-concurrency or already-exists failure
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Whether requeueing the key can make progress.
    ///
    /// Malformed keys and unusable source objects are producer bugs, not
    /// environment conditions, so retrying them only burns the backoff budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::MalformedKey(_) | Error::InvalidSource(_) | Error::Config(_)
        )
    }
}
