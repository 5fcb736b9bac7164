//! Constellation node operator
//!
//! Keeps every node of a confidential cluster on the OS image and Kubernetes
//! components declared in the `NodeVersion` resource. Outdated nodes are
//! replaced one budgeted step at a time: a fresh node is created in the same
//! scaling group, paired with the outdated one, inherits its labels and the
//! outdated node is drained and removed.
//!
//! Controllers:
//!
//! | Resource | Reconciler |
//! |---|---|
//! | `NodeVersion` | [`controller::node_version`] |
//! | `ScalingGroup` | [`controller::scaling_group`] |
//! | `PendingNode` | [`controller::pending_node`] |
//! | `AutoscalingStrategy` | [`controller::autoscaling_strategy`] |
//! | `JoiningNode` | [`controller::joining_node`] |
//!
//! Scaling groups themselves are discovered from the CSP by a polling
//! [`discovery::Executor`].

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod csp;
pub mod deploy;
pub mod discovery;
pub mod etcd;
pub mod health;
pub mod leader;
pub mod runner;
pub mod upgrade;

#[cfg(test)]
mod test_support;

use std::time::Duration;

pub use client::{KubeClient, KubeClientImpl};
pub use controller::Context;
pub use csp::{CloudProvider, DiscoveredScalingGroup, UnsupportedCloudProvider};
pub use etcd::{EtcdClient, EtcdRemover};
pub use upgrade::{UpgradeAgent, UpgradeAgentClient};

pub use constellation_common::{Error, Result};

/// Field manager used for every write of the operator
pub const FIELD_MANAGER: &str = "constellation-node-operator";

/// Extra nodes that may exist at any time during a rollout
pub const NODE_OVERPROVISION_LIMIT: u32 = 1;

/// Time a created node has to join before it is terminated
pub const NODE_JOIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Time a removed node has to be terminated by the CSP
pub const NODE_LEAVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Requeue interval for pending nodes that have not reached their goal
pub const PENDING_NODE_REQUEUE: Duration = Duration::from_secs(30);

/// Default polling interval of the scaling-group discovery
pub const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Min size of discovered scaling groups
pub const DEFAULT_SCALING_GROUP_MIN: i32 = 1;

/// Max size of discovered scaling groups
pub const DEFAULT_SCALING_GROUP_MAX: i32 = 10;

/// Deployment running the cluster-autoscaler
pub const AUTOSCALER_DEPLOYMENT_NAME: &str = "constellation-cluster-autoscaler";

/// Name of the coordination Lease used for leader election
pub const LEADER_LEASE_NAME: &str = "38cc1645.edgeless.systems";

/// Unix socket of the upgrade agent on control-plane hosts
pub const UPGRADE_AGENT_SOCKET: &str = "/run/constellation-upgrade-agent.sock";

/// Key of the Kubernetes version in `k8s-components-*` ConfigMaps
pub const CLUSTER_VERSION_KEY: &str = "cluster-version";

/// Default cloud config of the Azure adapter
pub const DEFAULT_AZURE_CLOUD_CONFIG: &str = "/etc/azure/azure.json";

/// Default cloud config of the GCP adapter
pub const DEFAULT_GCP_CLOUD_CONFIG: &str = "/etc/gce/gce.conf";
