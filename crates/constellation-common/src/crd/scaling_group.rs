//! ScalingGroup CRD: one CSP instance group (MIG, VMSS, ASG)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Role;

/// Reason when the CSP group already uses the declared image
pub const SCALING_GROUP_IMAGE_UP_TO_DATE_REASON: &str = "ScalingGroupNodeImageUpToDate";
/// Message when the CSP group already uses the declared image
pub const SCALING_GROUP_IMAGE_UP_TO_DATE_MESSAGE: &str =
    "Scaling group will use the latest image when creating new nodes";
/// Reason when the CSP group still uses an older image
pub const SCALING_GROUP_IMAGE_OUT_OF_DATE_REASON: &str = "ScalingGroupNodeImageOutOfDate";
/// Message when the CSP group still uses an older image
pub const SCALING_GROUP_IMAGE_OUT_OF_DATE_MESSAGE: &str =
    "Scaling group does not use latest image";

/// A CSP scaling group and the NodeVersion it follows
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "update.edgeless.systems",
    version = "v1alpha1",
    kind = "ScalingGroup",
    plural = "scalinggroups",
    status = "ScalingGroupStatus",
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.groupId"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.imageReference"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScalingGroupSpec {
    /// Name of the NodeVersion resource whose image this group should run
    #[serde(default)]
    pub node_version: String,
    /// CSP-canonical group ID
    #[serde(rename = "groupId", default)]
    pub group_id: String,
    /// Name of the group as understood by the cluster-autoscaler
    #[serde(default)]
    pub autoscaler_group_name: String,
    /// Human-readable node group name
    #[serde(default)]
    pub node_group_name: String,
    /// Whether the cluster-autoscaler may scale this group
    #[serde(default)]
    pub autoscaling: bool,
    /// Minimum group size for the autoscaler
    #[serde(default)]
    pub min: i32,
    /// Maximum group size for the autoscaler
    #[serde(default)]
    pub max: i32,
    /// Role of nodes in this group
    #[serde(default)]
    pub role: Role,
}

/// Observed CSP state of the group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingGroupStatus {
    /// Image the CSP currently uses for new instances
    #[serde(default)]
    pub image_reference: String,
    /// Outdated condition
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ScalingGroup {
    /// Image observed at the CSP, if any has been recorded
    pub fn observed_image(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.image_reference.as_str())
            .filter(|i| !i.is_empty())
    }
}
