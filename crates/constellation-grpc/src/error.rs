//! Error types for dialing and waiting

use thiserror::Error;

/// Errors creating a channel
#[derive(Debug, Error)]
pub enum DialError {
    /// Target is not a valid `host:port` endpoint
    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint {
        /// Endpoint as given
        endpoint: String,
        /// Parse failure
        message: String,
    },

    /// aTLS configuration could not be built
    #[error("aTLS config: {0}")]
    Atls(#[from] constellation_atls::AtlsError),
}

impl DialError {
    /// Create an invalid endpoint error
    pub fn invalid_endpoint(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }
}

/// Errors waiting for a node state
#[derive(Debug, Error)]
pub enum WaitError {
    /// Channel could not be created
    #[error(transparent)]
    Dial(#[from] DialError),

    /// Endpoint answered with a non-retryable status
    #[error("polling {endpoint}: {status}")]
    Status {
        /// Endpoint being polled
        endpoint: String,
        /// Returned status
        status: tonic::Status,
    },
}
