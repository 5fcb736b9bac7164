//! KMS errors

use thiserror::Error;

/// Errors raised by the KMS backend, server and client
#[derive(Debug, Error)]
pub enum KmsError {
    /// Request is malformed
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem
        message: String,
    },

    /// Key derivation failed
    #[error("deriving key: {message}")]
    Derivation {
        /// Description of the failure
        message: String,
    },

    /// Master secret could not be loaded
    #[error("loading master secret: {message}")]
    MasterSecret {
        /// Description of the failure
        message: String,
    },

    /// A listener or the gRPC server failed
    #[error("serving: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The remote KMS returned an error
    #[error("kms request failed: {0}")]
    Status(#[from] tonic::Status),

    /// Channel could not be created
    #[error(transparent)]
    Dial(#[from] constellation_grpc::DialError),

    /// aTLS configuration failed
    #[error(transparent)]
    Atls(#[from] constellation_atls::AtlsError),
}

impl KmsError {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    /// Create a derivation error
    pub fn derivation(msg: impl Into<String>) -> Self {
        Self::Derivation {
            message: msg.into(),
        }
    }

    /// Create a master secret error
    pub fn master_secret(msg: impl Into<String>) -> Self {
        Self::MasterSecret {
            message: msg.into(),
        }
    }
}
