//! Protocol buffer definitions for Constellation node lifecycle services.
//!
//! | Package | Served by | Used by |
//! |---|---|---|
//! | [`activation`] | join service (control plane, NodePort 30090) | join client, rejoin client |
//! | [`kms`] | KMS | join service |
//! | [`recover`] | rebooting node (port 9999) | operator CLI, rejoin client |
//! | [`nodestatus`] | every node | status waiter |
//! | [`upgrade`] | upgrade agent (unix socket) | node operator |
//! | [`etcd`] | etcd (subset of the v3 Cluster API) | node operator |
//!
//! # Recovery exchange
//!
//! ```text
//! client                         recovering node
//!   │ RecoverMessage{measurement_secret} │
//!   │ ──────────────────────────────────▶│
//!   │ RecoverResponse{disk_uuid}         │
//!   │ ◀──────────────────────────────────│
//!   │ RecoverMessage{state_disk_key}     │
//!   │ ──────────────────────────────────▶│
//!   │              half-close            │
//!   │ ◀──────────────────────────────────│
//! ```

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Node activation and rejoin
pub mod activation {
    tonic::include_proto!("activation");
}

/// Data-key derivation
pub mod kms {
    tonic::include_proto!("kms");
}

/// State-disk key recovery
pub mod recover {
    tonic::include_proto!("recoverproto");
}

/// Node lifecycle state
pub mod nodestatus {
    tonic::include_proto!("nodestatus");
}

/// Kubernetes control-plane upgrades
pub mod upgrade {
    tonic::include_proto!("upgrade");
}

/// etcd cluster membership
pub mod etcd {
    tonic::include_proto!("etcdserverpb");
}
