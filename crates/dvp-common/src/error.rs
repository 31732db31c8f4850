//! Error types for the DVP cloud provider
//!
//! Errors carry the resource coordinates they relate to so that a failure in
//! a reconciliation pass can be traced back to a specific object in the
//! infrastructure cluster.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cloud provider operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from the infrastructure or tenant cluster
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource that the operation requires does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind (e.g., "VirtualMachine", "Service")
        kind: String,
        /// Resource name
        name: String,
        /// Resource namespace (empty for cluster-scoped resources)
        namespace: String,
    },

    /// Provider ID does not match `<provider>://<instance>`
    #[error("provider ID {provider_id:?} didn't match expected format \"{expected}://<instance-id>\"")]
    InvalidProviderId {
        /// The rejected provider ID
        provider_id: String,
        /// The provider name the ID was expected to carry
        expected: &'static str,
    },

    /// The infrastructure cluster did not assign an ingress point in time
    #[error("load balancer {namespace}/{name} got no ingress within {timeout:?}")]
    ConvergenceTimeout {
        /// Backing service name
        name: String,
        /// Backing service namespace
        namespace: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The caller cancelled the operation while it was waiting
    #[error("operation cancelled [{context}]")]
    Cancelled {
        /// What was being waited on
        context: String,
    },

    /// Invalid or incomplete configuration
    #[error("configuration is invalid: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The offending config key (e.g., "loadBalancer.creationPollTimeout")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a namespaced resource
    pub fn not_found(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific key
    pub fn config_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the error means the requested object does not exist.
    ///
    /// Covers both the domain-level `NotFound` and a raw 404 from the API.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => api_code(source) == Some(404),
            _ => false,
        }
    }

    /// True when the API server rejected a write against a stale object
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source } if api_code(source) == Some(409))
    }

    /// Check if this error is worth retrying on a later reconciliation pass
    ///
    /// Malformed provider IDs and bad configuration need a human; everything
    /// else may resolve on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx other than conflict/throttling won't change on retry
                !matches!(
                    api_code(source),
                    Some(code) if (400..500).contains(&code) && code != 409 && code != 429
                )
            }
            Error::NotFound { .. } => true,
            Error::InvalidProviderId { .. } => false,
            Error::ConvergenceTimeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} from test", reason),
            reason: reason.to_string(),
            code,
        }),
    }
}
