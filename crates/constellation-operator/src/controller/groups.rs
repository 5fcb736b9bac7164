//! Node classification for the node-version reconciler
//!
//! Everything in here is pure: nodes and pending nodes go in, groups and
//! plans come out.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use constellation_common::crd::{
    set_condition, Condition, ConditionStatus, NodeVersionStatus, ObjectRef, PendingNode,
    PendingNodeGoal, ScalingGroup, CONDITION_OUTDATED, NODE_VERSIONS_OUT_OF_DATE_MESSAGE,
    NODE_VERSIONS_OUT_OF_DATE_REASON, NODE_VERSIONS_UP_TO_DATE_MESSAGE,
    NODE_VERSIONS_UP_TO_DATE_REASON,
};
use constellation_common::node::{
    self, COMPONENTS_ANNOTATION, DONOR_ANNOTATION, HEIR_ANNOTATION, NODE_IMAGE_ANNOTATION,
    OBSOLETE_ANNOTATION, SCALING_GROUP_ANNOTATION,
};

/// A freshly joined node together with the PendingNode that created it
#[derive(Clone, Debug)]
pub struct MintNode {
    /// The Kubernetes node
    pub node: Node,
    /// The joining PendingNode with the same name
    pub pending: PendingNode,
}

/// Disjoint classification of annotated nodes
#[derive(Clone, Debug, Default)]
pub struct NodeGroups {
    /// Wrong image or components and not yet paired
    pub outdated: Vec<Node>,
    /// On the target versions
    pub up_to_date: Vec<Node>,
    /// Outdated nodes with an heir
    pub donors: Vec<Node>,
    /// Up-to-date nodes replacing a donor
    pub heirs: Vec<Node>,
    /// Up-to-date nodes created by the operator and not paired yet
    pub mints: Vec<MintNode>,
    /// Nodes marked for deletion
    pub obsolete: Vec<Node>,
    /// Nodes whose image or components annotation is still missing
    pub awaiting_annotation: Vec<Node>,
}

impl NodeGroups {
    /// Whether there is nothing left to roll out
    pub fn all_up_to_date(&self, pending: &[PendingNode]) -> bool {
        self.outdated.is_empty()
            && self.heirs.is_empty()
            && self.awaiting_annotation.is_empty()
            && self.obsolete.is_empty()
            && pending.is_empty()
    }
}

fn is_obsolete(node: &Node) -> bool {
    node::annotation(node, OBSOLETE_ANNOTATION) == Some("true")
}

/// Classify `nodes` against the target image and components reference.
///
/// The checks run in a fixed order and the first match wins, so every node
/// lands in exactly one group.
pub fn group_nodes(
    nodes: Vec<Node>,
    pending: &[PendingNode],
    image: &str,
    components: &str,
) -> NodeGroups {
    let mut groups = NodeGroups::default();
    for node in nodes {
        if is_obsolete(&node) {
            groups.obsolete.push(node);
            continue;
        }
        let (Some(node_image), Some(node_components)) = (
            node::annotation(&node, NODE_IMAGE_ANNOTATION),
            node::annotation(&node, COMPONENTS_ANNOTATION),
        ) else {
            groups.awaiting_annotation.push(node);
            continue;
        };
        if !node_image.eq_ignore_ascii_case(image)
            || !node_components.eq_ignore_ascii_case(components)
        {
            if node::annotation(&node, HEIR_ANNOTATION).is_some() {
                groups.donors.push(node);
            } else {
                groups.outdated.push(node);
            }
            continue;
        }
        if node::annotation(&node, DONOR_ANNOTATION).is_some() {
            groups.heirs.push(node);
            continue;
        }
        let joiner = pending
            .iter()
            .find(|p| p.spec.node_name == node::name(&node) && p.is_ready_joiner());
        match joiner {
            Some(pending) => groups.mints.push(MintNode {
                node,
                pending: pending.clone(),
            }),
            None => groups.up_to_date.push(node),
        }
    }
    groups
}

/// Nodes that may still be created without exceeding `limit` extra nodes
pub fn new_nodes_budget(limit: u32, groups: &NodeGroups, pending: &[PendingNode]) -> u32 {
    let extra = groups.heirs.len() + groups.awaiting_annotation.len() + pending.len();
    limit.saturating_sub(u32::try_from(extra).unwrap_or(u32::MAX))
}

fn refs(nodes: &[Node]) -> Vec<ObjectRef> {
    nodes.iter().map(ObjectRef::from_resource).collect()
}

/// Status reflecting the classification of one reconcile pass
pub fn node_version_status(
    previous: Option<&NodeVersionStatus>,
    groups: &NodeGroups,
    invalid: &[Node],
    pending: &[PendingNode],
    budget: u32,
) -> NodeVersionStatus {
    let outdated = !groups.outdated.is_empty()
        || !groups.heirs.is_empty()
        || !pending.is_empty()
        || !groups.obsolete.is_empty();
    let (reason, message) = if outdated {
        (NODE_VERSIONS_OUT_OF_DATE_REASON, NODE_VERSIONS_OUT_OF_DATE_MESSAGE)
    } else {
        (NODE_VERSIONS_UP_TO_DATE_REASON, NODE_VERSIONS_UP_TO_DATE_MESSAGE)
    };

    let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    set_condition(
        &mut conditions,
        Condition::new(
            CONDITION_OUTDATED,
            ConditionStatus::from_bool(outdated),
            reason,
            message,
        ),
    );

    let mints: Vec<Node> = groups.mints.iter().map(|m| m.node.clone()).collect();
    NodeVersionStatus {
        outdated: refs(&groups.outdated),
        up_to_date: refs(&groups.up_to_date),
        donors: refs(&groups.donors),
        heirs: refs(&groups.heirs),
        mints: refs(&mints),
        pending: pending.iter().map(ObjectRef::from_resource).collect(),
        obsolete: refs(&groups.obsolete),
        invalid: refs(invalid),
        awaiting_annotation: refs(&groups.awaiting_annotation),
        budget,
        conditions,
        active_cluster_version_upgrade: previous
            .is_some_and(|s| s.active_cluster_version_upgrade),
    }
}

/// Scaling groups to create one node in each, in creation order.
///
/// Outdated nodes are counted per scaling group and nodes already joining
/// the group are subtracted. Only groups whose image already points to the
/// target get new nodes, and at most `budget` nodes are planned. Group IDs
/// compare case-insensitively.
pub fn plan_new_nodes(
    outdated: &[Node],
    pending: &[PendingNode],
    scaling_groups: &[ScalingGroup],
    image: &str,
    budget: u32,
) -> Vec<String> {
    let mut shortfall: BTreeMap<String, usize> = BTreeMap::new();
    for node in outdated {
        if node::annotation(node, HEIR_ANNOTATION).is_some() {
            continue;
        }
        if let Some(group) = node::annotation(node, SCALING_GROUP_ANNOTATION) {
            *shortfall.entry(group.to_lowercase()).or_default() += 1;
        }
    }
    for joiner in pending.iter().filter(|p| p.spec.goal == PendingNodeGoal::Join) {
        if let Some(count) = shortfall.get_mut(&joiner.spec.scaling_group_id.to_lowercase()) {
            *count = count.saturating_sub(1);
        }
    }

    let mut remaining = budget as usize;
    let mut plan = Vec::new();
    for (group_id, count) in shortfall {
        if remaining == 0 {
            break;
        }
        let Some(group) = scaling_groups
            .iter()
            .find(|sg| sg.spec.group_id.eq_ignore_ascii_case(&group_id))
        else {
            debug!(scaling_group = %group_id, "Scaling group has no matching resource");
            continue;
        };
        if !group
            .observed_image()
            .is_some_and(|observed| observed.eq_ignore_ascii_case(image))
        {
            debug!(scaling_group = %group_id, "Scaling group does not use the target image yet");
            continue;
        }
        let n = count.min(remaining);
        plan.extend((0..n).map(|_| group.spec.group_id.clone()));
        remaining -= n;
    }
    plan
}
