//! PendingNode CRD: a CSP instance that is joining or leaving the cluster

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What the pending node is expected to do
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PendingNodeGoal {
    /// Become a Kubernetes node
    #[default]
    Join,
    /// Be terminated at the CSP
    Leave,
}

/// Lifecycle state of an instance as reported by the CSP
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum CspNodeState {
    /// State could not be determined
    #[default]
    Unknown,
    /// Instance is being provisioned
    Creating,
    /// Instance is running
    Ready,
    /// Instance is stopped
    Stopped,
    /// Instance is being deleted
    Terminating,
    /// Instance is gone
    Terminated,
    /// Instance failed to provision
    Failed,
}

/// A node created or deleted by the operator whose CSP lifecycle is tracked
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "update.edgeless.systems",
    version = "v1alpha1",
    kind = "PendingNode",
    plural = "pendingnodes",
    status = "PendingNodeStatus",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Goal","type":"string","jsonPath":".spec.goal"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.cspState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PendingNodeSpec {
    /// CSP provider ID of the instance
    #[serde(rename = "providerID", default)]
    pub provider_id: String,
    /// Scaling group the instance belongs to
    #[serde(rename = "scalingGroupID", default)]
    pub scaling_group_id: String,
    /// Expected Kubernetes node name
    #[serde(default)]
    pub node_name: String,
    /// Join or Leave
    #[serde(default)]
    pub goal: PendingNodeGoal,
    /// Time after which the goal is considered failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Observed state of the pending instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingNodeStatus {
    /// Last CSP state seen
    #[serde(default)]
    pub csp_state: CspNodeState,
    /// Whether the goal has been reached
    #[serde(default)]
    pub reached_goal: bool,
}

impl PendingNode {
    /// Whether this pending node is a joiner the CSP reports as running
    pub fn is_ready_joiner(&self) -> bool {
        self.spec.goal == PendingNodeGoal::Join
            && self
                .status
                .as_ref()
                .is_some_and(|s| s.csp_state == CspNodeState::Ready)
    }

    /// Whether the deadline is set and lies before `now`
    pub fn deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.spec.deadline.is_some_and(|d| d < now)
    }
}
