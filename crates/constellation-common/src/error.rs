//! Error types for Constellation
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource or context it relates to, and
//! [`Error::is_retryable`] tells the controller error policy whether the
//! failure is transient.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Constellation operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Configuration error (missing annotation, unknown role, invalid spec)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Cloud service provider error
    #[error("cloud provider error: {message}")]
    CloudProvider {
        /// Description of what failed
        message: String,
        /// Whether retrying might succeed
        retryable: bool,
    },

    /// A resource does not exist (Kubernetes object or CSP instance)
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing resource
        kind: String,
        /// Name or ID of the missing resource
        name: String,
    },

    /// Optimistic concurrency conflict that survived all retries
    #[error("conflict updating {resource}: {message}")]
    Conflict {
        /// Name of the contended resource
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// File system error
    #[error("io error: {source}")]
    Io {
        /// The underlying IO error
        #[from]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error naming the offending resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a transient cloud provider error
    pub fn cloud_provider(msg: impl Into<String>) -> Self {
        Self::CloudProvider {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a cloud provider error that retrying will not fix
    pub fn cloud_provider_permanent(msg: impl Into<String>) -> Self {
        Self::CloudProvider {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
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

    /// Whether the failure is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => !matches!(source, kube::Error::Api(ae) if ae.code == 400 || ae.code == 422),
            Self::CloudProvider { retryable, .. } => *retryable,
            Self::Conflict { .. } | Self::Io { .. } | Self::Internal { .. } => true,
            Self::Validation { .. } | Self::Serialization { .. } | Self::NotFound { .. } => false,
        }
    }

    /// Whether the error means the resource does not exist (including HTTP 404)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Whether the error is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
