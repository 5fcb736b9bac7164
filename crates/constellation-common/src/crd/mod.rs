//! Custom Resource Definitions used by the node operator and join service
//!
//! All resources are cluster-scoped. The `update.edgeless.systems` group is
//! owned by Constellation; `NodeMaintenance` belongs to the node-maintenance
//! operator and is only consumed.

mod autoscaling_strategy;
mod joining_node;
mod node_maintenance;
mod node_version;
mod pending_node;
mod scaling_group;
mod types;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use autoscaling_strategy::{
    AutoscalingStrategy, AutoscalingStrategySpec, AutoscalingStrategyStatus,
};
pub use joining_node::{JoiningNode, JoiningNodeSpec, JoiningNodeStatus};
pub use node_maintenance::{
    MaintenancePhase, NodeMaintenance, NodeMaintenanceSpec, NodeMaintenanceStatus,
    REPLACEMENT_REASON,
};
pub use node_version::{
    NodeVersion, NodeVersionSpec, NodeVersionStatus, CONDITION_OUTDATED,
    NODE_VERSIONS_OUT_OF_DATE_MESSAGE, NODE_VERSIONS_OUT_OF_DATE_REASON,
    NODE_VERSIONS_UP_TO_DATE_MESSAGE, NODE_VERSIONS_UP_TO_DATE_REASON,
};
pub use pending_node::{
    CspNodeState, PendingNode, PendingNodeGoal, PendingNodeSpec, PendingNodeStatus,
};
pub use scaling_group::{
    ScalingGroup, ScalingGroupSpec, ScalingGroupStatus, SCALING_GROUP_IMAGE_OUT_OF_DATE_MESSAGE,
    SCALING_GROUP_IMAGE_OUT_OF_DATE_REASON, SCALING_GROUP_IMAGE_UP_TO_DATE_MESSAGE,
    SCALING_GROUP_IMAGE_UP_TO_DATE_REASON,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus, ObjectRef};

/// CRDs owned by Constellation, in installation order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        NodeVersion::crd(),
        ScalingGroup::crd(),
        PendingNode::crd(),
        JoiningNode::crd(),
        AutoscalingStrategy::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_are_cluster_scoped_in_update_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), 5);
        for crd in &crds {
            assert_eq!(crd.spec.group, "update.edgeless.systems");
            assert_eq!(crd.spec.scope, "Cluster");
        }
        assert_eq!(
            crds[0].metadata.name.as_deref(),
            Some("nodeversions.update.edgeless.systems")
        );
    }

    #[test]
    fn node_maintenance_is_external() {
        let crd = NodeMaintenance::crd();
        assert_eq!(crd.spec.group, "nodemaintenance.medik8s.io");
    }
}
