//! Constellation join service
//!
//! Runs on every control-plane node. Nodes that pass attestation receive
//! their state-disk key, the cluster identity, a kubelet certificate and a
//! kubeadm bootstrap token. Control-plane joiners also receive the key needed
//! to download the shared control-plane certificates.

#![deny(missing_docs)]

pub mod ca;
pub mod certkey;
pub mod error;
pub mod registry;
pub mod server;
pub mod token;

use std::time::Duration;

pub use error::JoinServiceError;
pub use server::ActivationServer;

/// Lifetime of bootstrap tokens handed to joining nodes
pub const JOIN_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Directory holding the cluster identity file
pub const DEFAULT_BASE_PATH: &str = "/var/constellation/joinservice";

/// Kubernetes cluster CA certificate
pub const CA_CERT_PATH: &str = "/etc/kubernetes/pki/ca.crt";

/// Kubernetes cluster CA key
pub const CA_KEY_PATH: &str = "/etc/kubernetes/pki/ca.key";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "join-service";

/// Result type alias for the join service
pub type Result<T> = std::result::Result<T, JoinServiceError>;
