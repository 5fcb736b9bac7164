//! Safe removal of a node from the cluster
//!
//! 1. request a drain through a `NodeMaintenance` and wait for it to succeed
//! 2. control-plane nodes leave etcd
//! 3. the node object is deleted
//! 4. the CSP instance is terminated (best effort)
//! 5. a leaving `PendingNode` tracks the termination

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::Resource;
use tracing::{debug, info, warn};

use constellation_common::crd::{
    NodeMaintenance, NodeMaintenanceSpec, NodeVersion, PendingNode, PendingNodeGoal,
    PendingNodeSpec, REPLACEMENT_REASON,
};
use constellation_common::node::{self, SCALING_GROUP_ANNOTATION};
use constellation_common::{Error, Result};

use crate::controller::Context;
use crate::NODE_LEAVE_TIMEOUT;

/// Retire `node`. Returns true once the node object is deleted and false
/// while the drain is still running.
pub async fn retire_node(ctx: &Context, owner: &NodeVersion, node: &Node) -> Result<bool> {
    let name = node::name(node);

    match ctx.kube.get_node_maintenance(name).await? {
        None => {
            let maintenance = NodeMaintenance::new(
                name,
                NodeMaintenanceSpec {
                    node_name: name.to_string(),
                    reason: REPLACEMENT_REASON.to_string(),
                },
            );
            ctx.kube.create_node_maintenance(&maintenance).await?;
            info!(node = %name, "Requested cordon and drain");
            return Ok(false);
        }
        Some(maintenance) if !maintenance.succeeded() => {
            debug!(node = %name, "Cordon and drain in progress");
            return Ok(false);
        }
        Some(_) => {}
    }

    if node::is_control_plane(node) {
        let vpc_ip = node::vpc_ip(node)?;
        ctx.etcd.remove_etcd_member(&vpc_ip).await?;
    }

    ctx.kube.delete_node(name).await?;
    info!(node = %name, "Deleted node");

    let provider_id = node::provider_id(node).unwrap_or_default();
    if let Err(e) = ctx.csp.delete_node(provider_id).await {
        warn!(node = %name, %provider_id, error = %e, "Scheduling CSP node deletion failed");
    }

    let deadline = chrono::Duration::from_std(NODE_LEAVE_TIMEOUT)
        .map_err(|e| Error::internal_with_context("retire_node", e.to_string()))?;
    let mut leaving = PendingNode::new(
        name,
        PendingNodeSpec {
            provider_id: provider_id.to_string(),
            scaling_group_id: node::annotation(node, SCALING_GROUP_ANNOTATION)
                .unwrap_or_default()
                .to_string(),
            node_name: name.to_string(),
            goal: PendingNodeGoal::Leave,
            deadline: Some(Utc::now() + deadline),
        },
    );
    leaving.metadata.owner_references = owner.controller_owner_ref(&()).map(|r| vec![r]);
    if let Err(e) = ctx.kube.create_pending_node(&leaving).await {
        warn!(node = %name, error = %e, "Tracking CSP node deletion failed");
    }
    Ok(true)
}
