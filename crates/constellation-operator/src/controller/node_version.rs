//! NodeVersion reconciler
//!
//! Rolls every node forward to the image and Kubernetes components declared
//! in the NodeVersion. Each pass:
//!
//! 1. starts a cluster-wide Kubernetes upgrade if the API server is behind
//! 2. annotates nodes with their scaling group and image
//! 3. classifies nodes and publishes the classification
//! 4. turns the cluster-autoscaler off while a rollout is running
//! 5. pairs fresh nodes (heirs) with outdated ones (donors)
//! 6. replaces donors whose heir is ready
//! 7. creates new nodes within the overprovisioning budget
//! 8. removes obsolete nodes

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use constellation_common::components::{Components, COMPONENTS_KEY};
use constellation_common::crd::{
    AutoscalingStrategy, NodeVersion, PendingNode, PendingNodeGoal, PendingNodeSpec, ScalingGroup,
};
use constellation_common::node::{
    self, DONOR_ANNOTATION, HEIR_ANNOTATION, NODE_IMAGE_ANNOTATION, OBSOLETE_ANNOTATION,
    SCALING_GROUP_ANNOTATION,
};
use constellation_common::retry::retry_on_conflict;
use constellation_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};

use super::groups::{group_nodes, new_nodes_budget, node_version_status, plan_new_nodes, MintNode};
use super::retire::retire_node;
use super::Context;
use crate::{NODE_JOIN_TIMEOUT, NODE_OVERPROVISION_LIMIT};

/// Requeue delay after a node was deleted
pub const NODE_DELETED_REQUEUE: Duration = Duration::from_secs(5);

/// A donor and the heir replacing it
#[derive(Clone, Debug)]
pub struct ReplacementPair {
    /// Outdated node
    pub donor: Node,
    /// Fresh node taking over its labels
    pub heir: Node,
}

/// Reconcile the NodeVersion
#[instrument(skip(nv, ctx), fields(node_version = %nv.name_any()))]
pub async fn reconcile(nv: Arc<NodeVersion>, ctx: Arc<Context>) -> Result<Action> {
    let name = nv.name_any();
    info!(node_version = %name, "Reconciling NodeVersion");

    let server_version = ctx.kube.server_version().await?;
    if needs_cluster_upgrade(&server_version, &nv.spec.kubernetes_cluster_version) {
        try_cluster_upgrade(&ctx, &name).await;
    }

    // At most one strategy is expected. Without any, autoscaling counts as off.
    let strategies = ctx.kube.list_autoscaling_strategies().await?;
    let autoscaling_enabled = strategies
        .iter()
        .any(|s| s.status.as_ref().is_some_and(|st| st.enabled));

    let nodes = ctx.kube.list_nodes().await?;
    let pending = ctx.kube.list_pending_nodes().await?;
    let scaling_groups = ctx.kube.list_scaling_groups().await?;

    let (annotated, invalid) = annotate_nodes(&ctx, nodes).await;
    let groups = group_nodes(
        annotated,
        &pending,
        &nv.spec.image_reference,
        &nv.spec.kubernetes_components_reference,
    );
    info!(
        outdated = groups.outdated.len(),
        up_to_date = groups.up_to_date.len(),
        donors = groups.donors.len(),
        heirs = groups.heirs.len(),
        mints = groups.mints.len(),
        pending = pending.len(),
        awaiting_annotation = groups.awaiting_annotation.len(),
        obsolete = groups.obsolete.len(),
        invalid = invalid.len(),
        "Grouped nodes"
    );

    let budget = new_nodes_budget(
        nv.overprovision_limit(NODE_OVERPROVISION_LIMIT),
        &groups,
        &pending,
    );
    debug!(budget, "Budget for new nodes");

    let status = node_version_status(nv.status.as_ref(), &groups, &invalid, &pending, budget);
    if let Err(e) = ctx.kube.update_node_version_status(&name, &status).await {
        warn!(error = %e, "Updating NodeVersion status failed");
    }

    let all_up_to_date = groups.all_up_to_date(&pending);
    ensure_autoscaling(&ctx, &strategies, autoscaling_enabled, all_up_to_date).await?;
    if all_up_to_date {
        info!("All node versions up to date");
        return Ok(Action::await_change());
    }

    let mut node_deleted = false;
    let mut outdated = groups.outdated;
    let mut pairs = pair_donors_and_heirs(&ctx, &nv, &mut outdated, groups.mints).await;
    pairs.extend(match_donors_and_heirs(&ctx, groups.donors, groups.heirs).await);

    for pair in &pairs {
        info!(donor = %node::name(&pair.donor), heir = %node::name(&pair.heir), "Replacing node");
        if replace_node(&ctx, &nv, pair).await? {
            node_deleted = true;
            if let Err(e) = set_annotation(&ctx, node::name(&pair.heir), DONOR_ANNOTATION, None).await
            {
                warn!(heir = %node::name(&pair.heir), error = %e, "Removing donor annotation failed");
            }
        }
    }

    // The autoscaler creates nodes on its own while it runs
    if autoscaling_enabled {
        return Ok(requeue(node_deleted));
    }

    if let Err(e) = create_new_nodes(&ctx, &nv, &outdated, &pending, &scaling_groups, budget).await
    {
        error!(error = %e, "Creating new nodes failed");
        return Ok(requeue(node_deleted));
    }

    for node in &groups.obsolete {
        match retire_node(&ctx, &nv, node).await {
            Ok(done) => node_deleted |= done,
            Err(e) => warn!(node = %node::name(node), error = %e, "Removing obsolete node failed"),
        }
    }

    Ok(requeue(node_deleted))
}

fn requeue(node_deleted: bool) -> Action {
    if node_deleted {
        Action::requeue(NODE_DELETED_REQUEUE)
    } else {
        Action::await_change()
    }
}

fn normalize_version(version: &str) -> &str {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    version.split('+').next().unwrap_or(version)
}

/// Whether the API server runs another version than `desired`.
///
/// A leading `v` and build metadata are ignored. An empty desired version
/// never triggers an upgrade.
pub fn needs_cluster_upgrade(server_version: &str, desired: &str) -> bool {
    !desired.trim().is_empty() && normalize_version(server_version) != normalize_version(desired)
}

/// Take the cluster upgrade lock and run the upgrade agent.
///
/// Losing the lock means another reconcile is already upgrading. If the agent
/// fails the lock stays held until an operator clears it.
pub async fn try_cluster_upgrade(ctx: &Context, name: &str) {
    match ctx.kube.swap_cluster_upgrade_flag(name, false, true).await {
        Ok(true) => {}
        Ok(false) => {
            debug!("Cluster version upgrade already in progress");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Taking the cluster upgrade lock failed");
            return;
        }
    }

    if let Err(e) = run_cluster_upgrade(ctx, name).await {
        error!(error = %e, "Cluster version upgrade failed, upgrade lock stays held");
        return;
    }

    let released = retry_on_conflict("release_upgrade_lock", || async {
        if ctx.kube.swap_cluster_upgrade_flag(name, true, false).await? {
            return Ok(());
        }
        match ctx.kube.get_node_version(name).await? {
            Some(nv) if nv.upgrade_in_progress() => {
                Err(Error::conflict(name, "upgrade flag changed concurrently"))
            }
            _ => Ok(()),
        }
    })
    .await;
    if let Err(e) = released {
        error!(error = %e, "Releasing the cluster upgrade lock failed");
    }
}

async fn run_cluster_upgrade(ctx: &Context, name: &str) -> Result<()> {
    let nv = ctx
        .kube
        .get_node_version(name)
        .await?
        .ok_or_else(|| Error::not_found("NodeVersion", name))?;
    let reference = &nv.spec.kubernetes_components_reference;
    let config_map = ctx
        .kube
        .get_config_map(KUBE_SYSTEM_NAMESPACE, reference)
        .await?
        .ok_or_else(|| Error::not_found("ConfigMap", reference))?;
    let raw = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(COMPONENTS_KEY))
        .ok_or_else(|| Error::validation_for(reference, "no components list"))?;
    let components = Components::parse(raw)?;
    let kubeadm = components.kubeadm()?;

    let version = &nv.spec.kubernetes_cluster_version;
    info!(cluster_version = %version, "Starting cluster upgrade");
    ctx.upgrade
        .upgrade(&kubeadm.url, &kubeadm.hash, version)
        .await
}

async fn set_annotation(ctx: &Context, node: &str, key: &str, value: Option<&str>) -> Result<()> {
    let patch = BTreeMap::from([(key.to_string(), value.map(str::to_string))]);
    retry_on_conflict("patch_node_annotations", || {
        ctx.kube.patch_node_annotations(node, patch.clone())
    })
    .await
}

/// Make sure every node carries its scaling-group and image annotations.
///
/// Returns the annotated nodes and the nodes that could not be annotated.
pub async fn annotate_nodes(ctx: &Context, nodes: Vec<Node>) -> (Vec<Node>, Vec<Node>) {
    let mut annotated = Vec::new();
    let mut invalid = Vec::new();
    for node in nodes {
        match annotate_node(ctx, &node).await {
            Ok(Some(node)) => annotated.push(node),
            Ok(None) => {
                info!(node = %node::name(&node), "Node vanished while annotating");
                invalid.push(node);
            }
            Err(e) => {
                warn!(node = %node::name(&node), error = %e, "Node is invalid");
                invalid.push(node);
            }
        }
    }
    (annotated, invalid)
}

async fn annotate_node(ctx: &Context, node: &Node) -> Result<Option<Node>> {
    let name = node::name(node);
    let provider_id = node::provider_id(node)
        .ok_or_else(|| Error::validation_for(name, "node has no provider ID"))?;

    let mut patch = BTreeMap::new();
    if node::annotation(node, SCALING_GROUP_ANNOTATION).is_none() {
        let group = ctx.csp.get_scaling_group_id(provider_id).await?;
        patch.insert(SCALING_GROUP_ANNOTATION.to_string(), Some(group));
    }
    if node::annotation(node, NODE_IMAGE_ANNOTATION).is_none() {
        let image = ctx.csp.get_node_image(provider_id).await?;
        patch.insert(NODE_IMAGE_ANNOTATION.to_string(), Some(image));
    }
    if patch.is_empty() {
        return Ok(Some(node.clone()));
    }

    retry_on_conflict("annotate_node", || {
        ctx.kube.patch_node_annotations(name, patch.clone())
    })
    .await?;
    ctx.kube.get_node(name).await
}

fn in_group(node: &Node, group: &str) -> bool {
    node::annotation(node, SCALING_GROUP_ANNOTATION).is_some_and(|g| g.eq_ignore_ascii_case(group))
}

fn remember_annotation(node: &mut Node, key: &str, value: &str) {
    node.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Pair each mint node with an unpaired outdated node of its scaling group.
///
/// Mint nodes without a partner are marked obsolete and retired. Paired
/// outdated nodes get their heir annotation in `outdated` too so that no
/// replacement is created for them in the same pass. Stops at the first
/// failed write.
pub async fn pair_donors_and_heirs(
    ctx: &Context,
    nv: &NodeVersion,
    outdated: &mut [Node],
    mints: Vec<MintNode>,
) -> Vec<ReplacementPair> {
    let mut pairs = Vec::new();
    for MintNode { mut node, pending } in mints {
        let heir_name = node::name(&node).to_string();
        let group = &pending.spec.scaling_group_id;
        let donor = outdated
            .iter_mut()
            .find(|o| in_group(o, group) && node::annotation(o, HEIR_ANNOTATION).is_none());

        let Some(donor) = donor else {
            info!(node = %heir_name, scaling_group = %group, "No outdated node to replace, marking obsolete");
            if let Err(e) = ctx.kube.delete_pending_node(&pending.name_any()).await {
                error!(pending_node = %pending.name_any(), error = %e, "Deleting PendingNode failed");
                break;
            }
            if let Err(e) = set_annotation(ctx, &heir_name, OBSOLETE_ANNOTATION, Some("true")).await {
                error!(node = %heir_name, error = %e, "Marking node obsolete failed");
                break;
            }
            if let Err(e) = retire_node(ctx, nv, &node).await {
                error!(node = %heir_name, error = %e, "Removing obsolete node failed");
                break;
            }
            continue;
        };

        let donor_name = node::name(donor).to_string();
        if let Err(e) = set_annotation(ctx, &heir_name, DONOR_ANNOTATION, Some(&donor_name)).await {
            error!(node = %heir_name, error = %e, "Setting donor annotation failed");
            break;
        }
        remember_annotation(&mut node, DONOR_ANNOTATION, &donor_name);
        if let Err(e) = set_annotation(ctx, &donor_name, HEIR_ANNOTATION, Some(&heir_name)).await {
            error!(node = %donor_name, error = %e, "Setting heir annotation failed");
            break;
        }
        remember_annotation(donor, HEIR_ANNOTATION, &heir_name);
        if let Err(e) = ctx.kube.delete_pending_node(&pending.name_any()).await {
            error!(pending_node = %pending.name_any(), error = %e, "Deleting PendingNode failed");
            break;
        }
        info!(donor = %donor_name, heir = %heir_name, "Paired donor and heir");
        pairs.push(ReplacementPair {
            donor: donor.clone(),
            heir: node,
        });
    }
    pairs
}

/// Rebuild pairs from existing annotations and drop one-sided ones
pub async fn match_donors_and_heirs(
    ctx: &Context,
    donors: Vec<Node>,
    heirs: Vec<Node>,
) -> Vec<ReplacementPair> {
    let mut pairs = Vec::new();
    for heir in heirs {
        let wanted = node::annotation(&heir, DONOR_ANNOTATION).unwrap_or_default();
        match donors.iter().find(|d| node::name(d) == wanted) {
            Some(donor) => pairs.push(ReplacementPair {
                donor: donor.clone(),
                heir,
            }),
            None => {
                info!(heir = %node::name(&heir), donor = %wanted, "Heir lost its donor");
                if let Err(e) = set_annotation(ctx, node::name(&heir), DONOR_ANNOTATION, None).await {
                    warn!(heir = %node::name(&heir), error = %e, "Removing donor annotation failed");
                }
            }
        }
    }
    for donor in &donors {
        let paired = pairs
            .iter()
            .any(|p| node::name(&p.donor) == node::name(donor));
        if !paired {
            info!(donor = %node::name(donor), "Donor lost its heir");
            if let Err(e) = set_annotation(ctx, node::name(donor), HEIR_ANNOTATION, None).await {
                warn!(donor = %node::name(donor), error = %e, "Removing heir annotation failed");
            }
        }
    }
    pairs
}

/// Copy labels to the heir and, once it is ready, retire the donor.
/// Returns true once the donor is gone.
pub async fn replace_node(ctx: &Context, nv: &NodeVersion, pair: &ReplacementPair) -> Result<bool> {
    let donor_labels = node::filter_labels(pair.donor.metadata.labels.as_ref());
    if donor_labels != node::filter_labels(pair.heir.metadata.labels.as_ref()) {
        ctx.kube
            .patch_node_labels(node::name(&pair.heir), donor_labels)
            .await?;
    }
    if !node::is_ready(&pair.heir) {
        debug!(heir = %node::name(&pair.heir), "Waiting for heir to become ready");
        return Ok(false);
    }
    retire_node(ctx, nv, &pair.donor).await
}

async fn ensure_autoscaling(
    ctx: &Context,
    strategies: &[AutoscalingStrategy],
    enabled: bool,
    want: bool,
) -> Result<()> {
    if enabled == want {
        return Ok(());
    }
    for strategy in strategies {
        let name = strategy.name_any();
        retry_on_conflict("set_autoscaling_enabled", || {
            ctx.kube.set_autoscaling_enabled(&name, want)
        })
        .await?;
        info!(autoscaling_strategy = %name, enabled = want, "Changed autoscaling");
    }
    Ok(())
}

async fn create_new_nodes(
    ctx: &Context,
    nv: &NodeVersion,
    outdated: &[Node],
    pending: &[PendingNode],
    scaling_groups: &[ScalingGroup],
    budget: u32,
) -> Result<()> {
    let plan = plan_new_nodes(outdated, pending, scaling_groups, &nv.spec.image_reference, budget);
    let timeout = chrono::Duration::from_std(NODE_JOIN_TIMEOUT)
        .map_err(|e| Error::internal_with_context("create_new_nodes", e.to_string()))?;

    for group_id in plan {
        info!(scaling_group = %group_id, "Creating new node");
        let (node_name, provider_id) = ctx.csp.create_node(&group_id).await?;
        let mut joining = PendingNode::new(
            &node_name,
            PendingNodeSpec {
                provider_id,
                scaling_group_id: group_id.clone(),
                node_name: node_name.clone(),
                goal: PendingNodeGoal::Join,
                deadline: Some(Utc::now() + timeout),
            },
        );
        joining.metadata.owner_references = nv.controller_owner_ref(&()).map(|r| vec![r]);
        ctx.kube.create_pending_node(&joining).await?;
        info!(node = %node_name, scaling_group = %group_id, "Created new node");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{joining_node, pending_node};
    use crate::test_support::{
        annotated_node, config_map, context_with, node, node_version, scaling_group, set_ready,
        with_annotation, with_label, FakeCluster, FakeCsp, RecordingEtcd,
    };
    use crate::upgrade::UpgradeAgent;
    use async_trait::async_trait;
    use constellation_common::crd::{
        AutoscalingStrategySpec, AutoscalingStrategyStatus, ConditionStatus, CspNodeState,
        JoiningNode, JoiningNodeSpec, MaintenancePhase, NodeMaintenanceStatus,
    };
    use constellation_common::node::COMPONENTS_ANNOTATION;
    use constellation_common::{AUTOSCALING_STRATEGY_RESOURCE_NAME, NODE_VERSION_RESOURCE_NAME};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const IMAGE: &str = "image-2";
    const COMPONENTS: &str = "k8s-components-2";

    fn strategy(enabled: bool) -> AutoscalingStrategy {
        let mut strategy = AutoscalingStrategy::new(
            AUTOSCALING_STRATEGY_RESOURCE_NAME,
            AutoscalingStrategySpec {
                enabled,
                ..Default::default()
            },
        );
        strategy.status = Some(AutoscalingStrategyStatus {
            enabled,
            replicas: i32::from(enabled),
        });
        strategy
    }

    fn cluster_with(nodes: Vec<Node>) -> FakeCluster {
        let cluster = FakeCluster::default();
        {
            let mut state = cluster.state();
            state.server_version = "v1.29.0".to_string();
            let mut nv = node_version(IMAGE, COMPONENTS);
            nv.spec.kubernetes_cluster_version = "v1.29.0".to_string();
            state
                .node_versions
                .insert(NODE_VERSION_RESOURCE_NAME.to_string(), nv);
            state
                .scaling_groups
                .insert("g1".to_string(), scaling_group("g1", "g1", IMAGE));
            state
                .strategies
                .insert(AUTOSCALING_STRATEGY_RESOURCE_NAME.to_string(), strategy(false));
        }
        for node in nodes {
            cluster.add_node(node);
        }
        cluster
    }

    async fn pass(cluster: &FakeCluster, ctx: &Arc<Context>) -> Action {
        reconcile(Arc::new(cluster.node_version()), ctx.clone())
            .await
            .unwrap()
    }

    fn annotation_of(cluster: &FakeCluster, name: &str, key: &str) -> Option<String> {
        cluster
            .node(name)
            .and_then(|n| node::annotation(&n, key).map(str::to_string))
    }

    // =========================================================================
    // Versions
    // =========================================================================

    #[test]
    fn version_comparison_ignores_prefix_and_build() {
        assert!(!needs_cluster_upgrade("v1.29.0", "v1.29.0"));
        assert!(!needs_cluster_upgrade("v1.29.0+k3s1", "1.29.0"));
        assert!(needs_cluster_upgrade("v1.29.0", "v1.29.1"));
        assert!(!needs_cluster_upgrade("v1.29.0", ""));
    }

    // =========================================================================
    // Cluster upgrade lock
    // =========================================================================

    #[derive(Default)]
    struct GatedUpgrade {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl UpgradeAgent for GatedUpgrade {
        async fn upgrade(&self, _url: &str, _hash: &str, _version: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    fn upgrade_cluster(agent: Arc<dyn UpgradeAgent>) -> (FakeCluster, Context) {
        let cluster = cluster_with(Vec::new());
        cluster.state().config_maps.insert(
            (KUBE_SYSTEM_NAMESPACE.to_string(), COMPONENTS.to_string()),
            config_map(
                KUBE_SYSTEM_NAMESPACE,
                COMPONENTS,
                &[(
                    COMPONENTS_KEY,
                    r#"[{"url":"https://dl.k8s.io/v1.29.1/bin/linux/amd64/kubeadm","hash":"sha256:bb"}]"#,
                )],
            ),
        );
        let ctx = Context::new(
            Arc::new(cluster.clone()),
            Arc::new(FakeCsp::default()),
            Arc::new(RecordingEtcd::default()),
            agent,
        );
        (cluster, ctx)
    }

    #[tokio::test]
    async fn only_one_concurrent_upgrade_runs() {
        let agent = Arc::new(GatedUpgrade::default());
        let (cluster, ctx) = upgrade_cluster(agent.clone());
        let ctx = Arc::new(ctx);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    try_cluster_upgrade(&ctx, NODE_VERSION_RESOURCE_NAME).await;
                })
            })
            .collect();

        // Every loser returns while the winner is still inside the agent
        while agent.calls.load(Ordering::SeqCst) == 0
            || handles.iter().filter(|h| h.is_finished()).count() < 7
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cluster.node_version().upgrade_in_progress());
        agent.release.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        assert!(!cluster.node_version().upgrade_in_progress());
    }

    #[tokio::test]
    async fn failed_upgrade_keeps_lock() {
        let mut agent = crate::upgrade::MockUpgradeAgent::new();
        agent
            .expect_upgrade()
            .withf(|url: &str, hash: &str, version: &str| {
                url.ends_with("/kubeadm") && hash == "sha256:bb" && version == "v1.29.0"
            })
            .times(1)
            .returning(|_, _, _| Err(Error::internal("kubeadm upgrade apply failed")));
        let (cluster, ctx) = upgrade_cluster(Arc::new(agent));

        try_cluster_upgrade(&ctx, NODE_VERSION_RESOURCE_NAME).await;
        assert!(cluster.node_version().upgrade_in_progress());

        // Further attempts lose the lock and never reach the agent
        try_cluster_upgrade(&ctx, NODE_VERSION_RESOURCE_NAME).await;
    }

    // =========================================================================
    // Annotation and pairing
    // =========================================================================

    #[tokio::test]
    async fn node_without_provider_id_is_invalid() {
        let mut broken = node("n0");
        broken.spec = None;
        let cluster = cluster_with(vec![broken]);
        let ctx = Arc::new(context_with(cluster.clone(), FakeCsp::default()));

        pass(&cluster, &ctx).await;
        let status = cluster.node_version().status.unwrap();
        assert_eq!(status.invalid.len(), 1);
        assert_eq!(status.invalid[0].name, "n0");
    }

    #[tokio::test]
    async fn broken_pairs_are_cleaned_up() {
        let orphan_heir = with_annotation(
            annotated_node("heir", IMAGE, COMPONENTS, "g1"),
            DONOR_ANNOTATION,
            "gone",
        );
        let orphan_donor = with_annotation(
            annotated_node("donor", "image-1", COMPONENTS, "g1"),
            HEIR_ANNOTATION,
            "also-gone",
        );
        let cluster = cluster_with(vec![orphan_heir.clone(), orphan_donor.clone()]);
        let ctx = context_with(cluster.clone(), FakeCsp::default());

        let pairs = match_donors_and_heirs(&ctx, vec![orphan_donor], vec![orphan_heir]).await;
        assert!(pairs.is_empty());
        assert_eq!(annotation_of(&cluster, "heir", DONOR_ANNOTATION), None);
        assert_eq!(annotation_of(&cluster, "donor", HEIR_ANNOTATION), None);
    }

    #[tokio::test]
    async fn unneeded_mint_becomes_obsolete() {
        let mint = annotated_node("g1-new-1", IMAGE, COMPONENTS, "g1");
        let cluster = cluster_with(vec![mint.clone()]);
        let pending = crate::test_support::pending_node(
            "g1-new-1",
            "g1",
            PendingNodeGoal::Join,
            CspNodeState::Ready,
        );
        cluster
            .state()
            .pending
            .insert("g1-new-1".to_string(), pending.clone());
        let ctx = context_with(cluster.clone(), FakeCsp::default());

        let pairs = pair_donors_and_heirs(
            &ctx,
            &cluster.node_version(),
            &mut [],
            vec![MintNode {
                node: mint,
                pending,
            }],
        )
        .await;
        assert!(pairs.is_empty());
        assert!(cluster.state().pending.is_empty());
        assert_eq!(
            annotation_of(&cluster, "g1-new-1", OBSOLETE_ANNOTATION).as_deref(),
            Some("true")
        );
        assert!(cluster.state().maintenances.contains_key("g1-new-1"));
    }

    #[tokio::test]
    async fn enabled_autoscaler_is_turned_off_and_creates_nothing() {
        let cluster = cluster_with(vec![annotated_node("n1", "image-1", COMPONENTS, "g1")]);
        cluster.state().strategies.insert(
            AUTOSCALING_STRATEGY_RESOURCE_NAME.to_string(),
            strategy(true),
        );
        let csp = FakeCsp::default();
        let ctx = Arc::new(context_with(cluster.clone(), csp.clone()));

        pass(&cluster, &ctx).await;
        assert!(!cluster.state().strategies[AUTOSCALING_STRATEGY_RESOURCE_NAME].spec.enabled);
        assert_eq!(csp.state().created, 0);
    }

    // =========================================================================
    // Rollout
    // =========================================================================

    #[tokio::test]
    async fn story_outdated_node_is_replaced() {
        let donor = with_label(
            annotated_node("n1", "image-1", COMPONENTS, "g1"),
            "team",
            "payments",
        );
        let cluster = cluster_with(vec![donor]);
        let csp = FakeCsp::default();
        csp.state()
            .group_images
            .insert("g1".to_string(), IMAGE.to_string());
        csp.add_instance("n1", "g1", "image-1", CspNodeState::Ready);
        let ctx = Arc::new(context_with(cluster.clone(), csp.clone()));

        // Pass 1: a replacement is created, nothing is deleted
        pass(&cluster, &ctx).await;
        {
            let state = cluster.state();
            assert_eq!(state.pending.len(), 1);
            let joining = &state.pending["g1-new-1"];
            assert_eq!(joining.spec.goal, PendingNodeGoal::Join);
            assert_eq!(joining.spec.scaling_group_id, "g1");
            assert!(joining.spec.deadline.is_some());
            assert!(state.nodes.contains_key("n1"));
            let status = state.node_versions[NODE_VERSION_RESOURCE_NAME]
                .status
                .clone()
                .unwrap();
            assert_eq!(status.conditions[0].status, ConditionStatus::True);
            assert_eq!(status.outdated[0].name, "n1");
        }

        // A second pass does not create another node
        pass(&cluster, &ctx).await;
        assert_eq!(csp.state().created, 1);

        // The instance boots and joins with the target components
        csp.set_state("g1-new-1", CspNodeState::Ready);
        cluster.add_node(set_ready(node("g1-new-1"), false));
        let joining = JoiningNode::new(
            "g1-new-1",
            JoiningNodeSpec {
                name: "g1-new-1".to_string(),
                components_reference: COMPONENTS.to_string(),
                ..Default::default()
            },
        );
        cluster
            .state()
            .joining
            .insert("g1-new-1".to_string(), joining.clone());
        joining_node::reconcile(Arc::new(joining), ctx.clone())
            .await
            .unwrap();
        assert_eq!(
            annotation_of(&cluster, "g1-new-1", COMPONENTS_ANNOTATION).as_deref(),
            Some(COMPONENTS)
        );
        let joiner = cluster.state().pending["g1-new-1"].clone();
        pending_node::reconcile(Arc::new(joiner), ctx.clone())
            .await
            .unwrap();

        // Pass 2: mint node is paired and inherits the labels
        pass(&cluster, &ctx).await;
        assert_eq!(
            annotation_of(&cluster, "g1-new-1", DONOR_ANNOTATION).as_deref(),
            Some("n1")
        );
        assert_eq!(
            annotation_of(&cluster, "n1", HEIR_ANNOTATION).as_deref(),
            Some("g1-new-1")
        );
        let heir = cluster.node("g1-new-1").unwrap();
        assert_eq!(
            heir.metadata.labels.as_ref().unwrap()["team"],
            "payments"
        );
        assert!(cluster.state().pending.is_empty());
        assert!(cluster.state().maintenances.is_empty());

        // Pass 3: heir is ready, the donor is drained
        {
            let mut state = cluster.state();
            let heir = state.nodes.remove("g1-new-1").unwrap();
            state
                .nodes
                .insert("g1-new-1".to_string(), set_ready(heir, true));
        }
        pass(&cluster, &ctx).await;
        assert!(cluster.state().maintenances.contains_key("n1"));
        assert!(cluster.node("n1").is_some());

        // Pass 4: drain finished, the donor is removed
        cluster
            .state()
            .maintenances
            .get_mut("n1")
            .unwrap()
            .status = Some(NodeMaintenanceStatus {
            phase: Some(MaintenancePhase::Succeeded),
            last_error: None,
        });
        let action = pass(&cluster, &ctx).await;
        assert_eq!(action, Action::requeue(NODE_DELETED_REQUEUE));
        assert!(cluster.node("n1").is_none());
        assert_eq!(annotation_of(&cluster, "g1-new-1", DONOR_ANNOTATION), None);
        assert!(csp.state().deleted.contains(&"fake://n1".to_string()));
        let leaving = cluster.state().pending["n1"].clone();
        assert_eq!(leaving.spec.goal, PendingNodeGoal::Leave);

        // The CSP terminates the instance
        csp.set_state("n1", CspNodeState::Terminated);
        pending_node::reconcile(Arc::new(leaving), ctx.clone())
            .await
            .unwrap();
        assert!(cluster.state().pending.is_empty());

        // Pass 5: everything is up to date
        let action = pass(&cluster, &ctx).await;
        assert_eq!(action, Action::await_change());
        let status = cluster.node_version().status.unwrap();
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
        assert_eq!(status.up_to_date.len(), 1);
        assert_eq!(status.up_to_date[0].name, "g1-new-1");
        assert!(cluster.state().strategies[AUTOSCALING_STRATEGY_RESOURCE_NAME].spec.enabled);
    }
}
