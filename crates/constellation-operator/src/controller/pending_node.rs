//! PendingNode reconciler
//!
//! Follows a CSP instance the operator created or removed until it reached
//! its goal. Joiners that miss their deadline are terminated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use constellation_common::crd::{CspNodeState, PendingNode, PendingNodeGoal, PendingNodeStatus};
use constellation_common::Result;

use super::Context;
use crate::PENDING_NODE_REQUEUE;

/// Reconcile a PendingNode
#[instrument(skip(pending, ctx), fields(pending_node = %pending.name_any()))]
pub async fn reconcile(pending: Arc<PendingNode>, ctx: Arc<Context>) -> Result<Action> {
    let name = pending.name_any();
    let spec = &pending.spec;

    let csp_state = match ctx.csp.get_node_state(&spec.provider_id).await {
        Ok(state) => state,
        Err(e) if e.is_not_found() => CspNodeState::Terminated,
        Err(e) => return Err(e),
    };
    let reached_goal = match spec.goal {
        PendingNodeGoal::Join => {
            csp_state == CspNodeState::Ready && ctx.kube.get_node(&spec.node_name).await?.is_some()
        }
        PendingNodeGoal::Leave => csp_state == CspNodeState::Terminated,
    };
    debug!(pending_node = %name, ?csp_state, reached_goal, "Observed pending node");

    ctx.kube
        .update_pending_node_status(
            &name,
            &PendingNodeStatus {
                csp_state,
                reached_goal,
            },
        )
        .await?;

    if reached_goal {
        if spec.goal == PendingNodeGoal::Leave {
            info!(pending_node = %name, "Node left the cluster");
            ctx.kube.delete_pending_node(&name).await?;
        }
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    if spec.goal == PendingNodeGoal::Join && pending.deadline_exceeded(now) {
        info!(pending_node = %name, "Node did not join in time, terminating it");
        if let Err(e) = ctx.csp.delete_node(&spec.provider_id).await {
            warn!(pending_node = %name, error = %e, "Terminating node failed");
            return Err(e);
        }
        ctx.kube
            .update_pending_node_goal(&name, PendingNodeGoal::Leave, None)
            .await?;
        return Ok(Action::requeue(PENDING_NODE_REQUEUE));
    }

    Ok(Action::requeue(next_check(&pending, now)))
}

fn next_check(pending: &PendingNode, now: chrono::DateTime<Utc>) -> Duration {
    pending
        .spec
        .deadline
        .and_then(|deadline| (deadline - now).to_std().ok())
        .map_or(PENDING_NODE_REQUEUE, |left| left.min(PENDING_NODE_REQUEUE))
}

/// PendingNodes tracking the node `node_name`
pub fn pending_nodes_for_node(
    node_name: &str,
    pending: &[Arc<PendingNode>],
) -> Vec<ObjectRef<PendingNode>> {
    pending
        .iter()
        .filter(|p| p.spec.node_name == node_name)
        .map(|p| ObjectRef::from_obj(p.as_ref()))
        .collect()
}
