//! Error types for node services

use constellation_grpc::DialError;
use thiserror::Error;

/// Errors from activating and joining the node
#[derive(Debug, Error)]
pub enum JoinClientError {
    /// Encrypted state disk could not be opened or updated
    #[error("state disk: {message}")]
    Disk {
        /// Description of the failure
        message: String,
    },

    /// Instance metadata is unavailable or incomplete
    #[error("metadata: {message}")]
    Metadata {
        /// Description of the failure
        message: String,
    },

    /// Another activation already holds the node lock
    #[error("node is already being initialized")]
    AlreadyInitializing,

    /// Join attempt did not finish within its deadline
    #[error("join attempt timed out")]
    Timeout,

    /// Node role does not allow joining
    #[error("cannot join cluster with role {role}")]
    UnsupportedRole {
        /// Role reported by metadata
        role: constellation_common::role::Role,
    },

    /// Building the channel failed
    #[error(transparent)]
    Dial(#[from] DialError),

    /// Join service answered with an error
    #[error("activation failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// Writing the node state file failed
    #[error("persisting node state: {0}")]
    Persist(#[from] constellation_common::Error),

    /// kubeadm join failed
    #[error("joining cluster: {message}")]
    Join {
        /// Description of the failure
        message: String,
    },
}

impl JoinClientError {
    /// Create a disk error
    pub fn disk(message: impl ToString) -> Self {
        Self::Disk {
            message: message.to_string(),
        }
    }

    /// Create a metadata error
    pub fn metadata(message: impl ToString) -> Self {
        Self::Metadata {
            message: message.to_string(),
        }
    }

    /// Create a join error
    pub fn join(message: impl ToString) -> Self {
        Self::Join {
            message: message.to_string(),
        }
    }
}

/// Errors from recovering the state-disk key
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Recovery was cancelled before a key arrived
    #[error("recovery cancelled")]
    Cancelled,

    /// The recovery listener failed
    #[error("serving recovery API: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Building a channel failed
    #[error(transparent)]
    Dial(#[from] DialError),

    /// aTLS setup failed
    #[error(transparent)]
    Atls(#[from] constellation_atls::AtlsError),
}
