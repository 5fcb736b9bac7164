//! NodeMaintenance CRD owned by the node-maintenance operator (medik8s)
//!
//! Only the fields used to request and observe a drain are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reason recorded on maintenances requested for node replacement
pub const REPLACEMENT_REASON: &str = "node is replaced due to OS image update";

/// Progress of a maintenance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MaintenancePhase {
    /// Cordon and drain in progress
    #[default]
    Running,
    /// Node is drained
    Succeeded,
    /// Drain failed
    Failed,
}

/// Request to cordon and drain a node
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nodemaintenance.medik8s.io",
    version = "v1beta1",
    kind = "NodeMaintenance",
    plural = "nodemaintenances",
    status = "NodeMaintenanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceSpec {
    /// Node to put into maintenance
    pub node_name: String,
    /// Why the maintenance was requested
    #[serde(default)]
    pub reason: String,
}

/// Reported progress of the drain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MaintenancePhase>,
    /// Last drain error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl NodeMaintenance {
    /// Whether the node has been drained
    pub fn succeeded(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .is_some_and(|p| p == MaintenancePhase::Succeeded)
    }
}
