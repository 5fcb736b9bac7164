//! NodeVersion CRD: the declared OS image and Kubernetes version of the cluster
//!
//! A single NodeVersion named [`crate::NODE_VERSION_RESOURCE_NAME`] exists per
//! cluster. Its status lists every node classified by the node-version
//! reconciler and holds the cluster-upgrade lock flag.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectRef};

/// Condition type reporting whether any node runs an outdated version
pub const CONDITION_OUTDATED: &str = "Outdated";
/// Reason when every node runs the declared version
pub const NODE_VERSIONS_UP_TO_DATE_REASON: &str = "NodeVersionsUpToDate";
/// Message when every node runs the declared version
pub const NODE_VERSIONS_UP_TO_DATE_MESSAGE: &str = "Node version of every node is up to date";
/// Reason when some nodes still run an older version
pub const NODE_VERSIONS_OUT_OF_DATE_REASON: &str = "NodeVersionsOutOfDate";
/// Message when some nodes still run an older version
pub const NODE_VERSIONS_OUT_OF_DATE_MESSAGE: &str = "Some node versions are out of date";

/// Desired OS image and Kubernetes version for all nodes.
///
/// Example:
/// ```yaml
/// apiVersion: update.edgeless.systems/v1alpha1
/// kind: NodeVersion
/// metadata:
///   name: constellation-version
/// spec:
///   image: projects/constellation-images/global/images/constellation-v2-5-0
///   imageVersion: v2.5.0
///   kubernetesComponentsReference: k8s-components-sha256-4e9b8a...
///   kubernetesClusterVersion: v1.29.1
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "update.edgeless.systems",
    version = "v1alpha1",
    kind = "NodeVersion",
    plural = "nodeversions",
    status = "NodeVersionStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.imageVersion"}"#,
    printcolumn = r#"{"name":"Kubernetes","type":"string","jsonPath":".spec.kubernetesClusterVersion"}"#,
    printcolumn = r#"{"name":"Budget","type":"integer","jsonPath":".status.budget"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionSpec {
    /// CSP-specific reference of the OS image nodes should run
    #[serde(rename = "image", default)]
    pub image_reference: String,

    /// Human-readable version of the image
    #[serde(default)]
    pub image_version: String,

    /// Name of the ConfigMap listing the Kubernetes components
    #[serde(default)]
    pub kubernetes_components_reference: String,

    /// Kubernetes version the control plane should run (e.g. `v1.29.1`)
    #[serde(default)]
    pub kubernetes_cluster_version: String,

    /// Upper bound on extra nodes created during a rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_node_budget: Option<u32>,
}

/// Observed state of the rollout
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionStatus {
    /// Nodes running an older version without a replacement yet
    #[serde(default)]
    pub outdated: Vec<ObjectRef>,
    /// Nodes running the declared version
    #[serde(default)]
    pub up_to_date: Vec<ObjectRef>,
    /// Outdated nodes paired with an heir
    #[serde(default)]
    pub donors: Vec<ObjectRef>,
    /// New nodes taking over from a donor
    #[serde(default)]
    pub heirs: Vec<ObjectRef>,
    /// New up-to-date nodes not yet paired
    #[serde(default)]
    pub mints: Vec<ObjectRef>,
    /// PendingNodes still joining or leaving
    #[serde(default)]
    pub pending: Vec<ObjectRef>,
    /// Nodes scheduled for removal
    #[serde(default)]
    pub obsolete: Vec<ObjectRef>,
    /// Nodes that could not be classified
    #[serde(default)]
    pub invalid: Vec<ObjectRef>,
    /// Nodes lacking the image or components annotation
    #[serde(default)]
    pub awaiting_annotation: Vec<ObjectRef>,
    /// Number of nodes that may still be created in this pass
    #[serde(default)]
    pub budget: u32,
    /// Outdated condition
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Lock flag held while the control plane is being upgraded
    #[serde(default)]
    pub active_cluster_version_upgrade: bool,
}

impl NodeVersion {
    /// Overprovisioning limit for this rollout
    pub fn overprovision_limit(&self, default: u32) -> u32 {
        self.spec.max_node_budget.unwrap_or(default)
    }

    /// Whether another reconciler currently holds the upgrade lock
    pub fn upgrade_in_progress(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.active_cluster_version_upgrade)
    }
}
