//! Join service errors

use thiserror::Error;

/// Errors raised while assembling join credentials
#[derive(Debug, Error)]
pub enum JoinServiceError {
    /// Kubernetes API call failed
    #[error("kubernetes: {0}")]
    Kube(#[from] kube::Error),

    /// Shared helpers failed (file handling, node names, ...)
    #[error(transparent)]
    Common(#[from] constellation_common::Error),

    /// The KMS did not return a key
    #[error("kms: {0}")]
    Kms(#[from] constellation_kms::KmsError),

    /// Certificate could not be loaded or signed
    #[error("certificate: {message}")]
    Certificate {
        /// Description of the failure
        message: String,
    },

    /// Bootstrap token or discovery data could not be produced
    #[error("bootstrap token: {message}")]
    Token {
        /// Description of the failure
        message: String,
    },

    /// External command failed
    #[error("running {command}: {message}")]
    Command {
        /// Command that failed
        command: String,
        /// Exit status and stderr
        message: String,
    },

    /// Filesystem access failed
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl JoinServiceError {
    /// Create a certificate error
    pub fn certificate(msg: impl ToString) -> Self {
        Self::Certificate {
            message: msg.to_string(),
        }
    }

    /// Create a token error
    pub fn token(msg: impl ToString) -> Self {
        Self::Token {
            message: msg.to_string(),
        }
    }

    /// Create a command error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }
}
