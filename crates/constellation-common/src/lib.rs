//! Common types for Constellation: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod components;
pub mod crd;
pub mod error;
pub mod file;
pub mod id;
pub mod kube_utils;
pub mod kubeadm;
pub mod node;
pub mod retry;
pub mod role;

pub use error::Error;
pub use role::Role;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding cluster-system resources (components ConfigMaps, autoscaler, CA)
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Name of the singleton NodeVersion resource
pub const NODE_VERSION_RESOURCE_NAME: &str = "constellation-version";

/// Name of the singleton AutoscalingStrategy resource
pub const AUTOSCALING_STRATEGY_RESOURCE_NAME: &str = "autoscalingstrategy";

/// Port the join service listens on inside the cluster
pub const JOIN_SERVICE_PORT: u16 = 9090;

/// NodePort under which control-plane nodes expose the join service
pub const JOIN_SERVICE_NODE_PORT: u16 = 30090;

/// Port of the plain (in-cluster) KMS listener
pub const KMS_PORT: u16 = 9000;

/// Port of the attested KMS listener
pub const KMS_ATLS_PORT: u16 = 9001;

/// Port the boot-time recovery server binds to
pub const RECOVERY_PORT: u16 = 9999;

/// Port of the node status service
pub const NODE_STATUS_PORT: u16 = 9998;

/// Length in bytes of a state-disk encryption key
pub const STATE_DISK_KEY_LENGTH: usize = 32;

/// Default length in bytes of derived keys (measurement secret, data keys)
pub const DERIVED_KEY_LENGTH_DEFAULT: usize = 32;

/// Key ID under which the measurement secret is derived by the KMS
pub const MEASUREMENT_SECRET_CONTEXT: &str = "measurementSecret";

/// Environment variable naming the cloud service provider
pub const CONSTELLATION_CSP_ENV: &str = "CONSTEL_CSP";

/// Environment variable holding the uid used to tag CSP resources of this cluster
pub const CONSTELLATION_UID_ENV: &str = "constellation-uid";
