//! JoiningNode reconciler
//!
//! The join service records which Kubernetes components a node joined with.
//! Once the node registers, the reference is copied onto the node as an
//! annotation and the record is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use constellation_common::crd::JoiningNode;
use constellation_common::node::COMPONENTS_ANNOTATION;
use constellation_common::retry::retry_on_conflict;
use constellation_common::Result;

use super::Context;

/// Requeue interval while the node has not registered
pub const NODE_REGISTRATION_REQUEUE: Duration = Duration::from_secs(30);

/// Reconcile a JoiningNode
#[instrument(skip(joining, ctx), fields(joining_node = %joining.name_any()))]
pub async fn reconcile(joining: Arc<JoiningNode>, ctx: Arc<Context>) -> Result<Action> {
    let name = joining.name_any();
    let node_name = &joining.spec.name;

    if ctx.kube.get_node(node_name).await?.is_none() {
        if joining.spec.deadline.is_some_and(|d| d < Utc::now()) {
            info!(joining_node = %name, node = %node_name, "Node never registered, dropping record");
            ctx.kube.delete_joining_node(&name).await?;
            return Ok(Action::await_change());
        }
        debug!(node = %node_name, "Waiting for node to register");
        return Ok(Action::requeue(NODE_REGISTRATION_REQUEUE));
    }

    let patch = BTreeMap::from([(
        COMPONENTS_ANNOTATION.to_string(),
        Some(joining.spec.components_reference.clone()),
    )]);
    retry_on_conflict("annotate_components", || {
        ctx.kube.patch_node_annotations(node_name, patch.clone())
    })
    .await?;
    info!(
        node = %node_name,
        components = %joining.spec.components_reference,
        "Annotated node with its Kubernetes components"
    );

    ctx.kube.delete_joining_node(&name).await?;
    Ok(Action::await_change())
}

/// JoiningNodes waiting for the node `node_name`
pub fn joining_nodes_for_node(
    node_name: &str,
    joining: &[Arc<JoiningNode>],
) -> Vec<ObjectRef<JoiningNode>> {
    joining
        .iter()
        .filter(|j| j.spec.name == node_name)
        .map(|j| ObjectRef::from_obj(j.as_ref()))
        .collect()
}
