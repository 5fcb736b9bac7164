//! Controller runner - builds controller futures per custom resource
//!
//! Each `build_*` function returns boxed futures that the caller composes,
//! so `main` decides which controllers run on which CSP.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::Notify;

use constellation_common::crd::{
    AutoscalingStrategy, JoiningNode, NodeMaintenance, NodeVersion, PendingNode, ScalingGroup,
};
use constellation_common::NODE_VERSION_RESOURCE_NAME;

use crate::controller::{
    autoscaling_strategy, error_policy, joining_node, node_version, pending_node, scaling_group,
    Context,
};
use crate::discovery::Executor;
use crate::health::Metrics;

/// Watcher timeout (seconds), below the client read timeout of 30s so that
/// idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn singleton_node_version() -> ObjectRef<NodeVersion> {
    ObjectRef::new(NODE_VERSION_RESOURCE_NAME)
}

/// NodeVersion a ScalingGroup follows
pub fn node_version_for_scaling_group(group: &ScalingGroup) -> Option<ObjectRef<NodeVersion>> {
    let name = &group.spec.node_version;
    (!name.is_empty()).then(|| ObjectRef::new(name))
}

/// ScalingGroups following the NodeVersion `name`
pub fn scaling_groups_for_node_version(
    name: &str,
    groups: &[Arc<ScalingGroup>],
) -> Vec<ObjectRef<ScalingGroup>> {
    groups
        .iter()
        .filter(|g| g.spec.node_version == name)
        .map(|g| ObjectRef::from_obj(g.as_ref()))
        .collect()
}

/// Build the NodeVersion controller
///
/// Node, ScalingGroup, AutoscalingStrategy, NodeMaintenance and JoiningNode
/// changes all requeue the NodeVersion. PendingNodes it created are owned.
pub fn build_node_version_controllers(
    client: Client,
    ctx: Arc<Context>,
    metrics: Arc<Metrics>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let node_versions: Api<NodeVersion> = Api::all(client.clone());

    tracing::info!("- NodeVersion controller");

    vec![Box::pin(
        Controller::new(node_versions, watcher_config())
            .owns(Api::<PendingNode>::all(client.clone()), watcher_config())
            .watches(
                Api::<ScalingGroup>::all(client.clone()),
                watcher_config(),
                |group| node_version_for_scaling_group(&group),
            )
            .watches(
                Api::<AutoscalingStrategy>::all(client.clone()),
                watcher_config(),
                |_| Some(singleton_node_version()),
            )
            .watches(Api::<Node>::all(client.clone()), watcher_config(), |_| {
                Some(singleton_node_version())
            })
            .watches(
                Api::<NodeMaintenance>::all(client.clone()),
                watcher_config(),
                |_| Some(singleton_node_version()),
            )
            .watches(Api::<JoiningNode>::all(client), watcher_config(), |_| {
                Some(singleton_node_version())
            })
            .shutdown_on_signal()
            .run(node_version::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("NodeVersion", metrics)),
    )]
}

/// Build the ScalingGroup controller, requeued when its NodeVersion changes
pub fn build_scaling_group_controllers(
    client: Client,
    ctx: Arc<Context>,
    metrics: Arc<Metrics>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let controller = Controller::new(Api::<ScalingGroup>::all(client.clone()), watcher_config());
    let groups = controller.store();

    tracing::info!("- ScalingGroup controller");

    vec![Box::pin(
        controller
            .watches(
                Api::<NodeVersion>::all(client),
                watcher_config(),
                move |nv| scaling_groups_for_node_version(&nv.name_any(), &groups.state()),
            )
            .shutdown_on_signal()
            .run(scaling_group::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ScalingGroup", metrics)),
    )]
}

/// Build the PendingNode controller, requeued when the tracked node changes
pub fn build_pending_node_controllers(
    client: Client,
    ctx: Arc<Context>,
    metrics: Arc<Metrics>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let controller = Controller::new(Api::<PendingNode>::all(client.clone()), watcher_config());
    let pending = controller.store();

    tracing::info!("- PendingNode controller");

    vec![Box::pin(
        controller
            .watches(Api::<Node>::all(client), watcher_config(), move |node| {
                pending_node::pending_nodes_for_node(&node.name_any(), &pending.state())
            })
            .shutdown_on_signal()
            .run(pending_node::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("PendingNode", metrics)),
    )]
}

/// Build the AutoscalingStrategy controller, requeued on ScalingGroup changes
pub fn build_autoscaling_controllers(
    client: Client,
    ctx: Arc<Context>,
    metrics: Arc<Metrics>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let controller = Controller::new(
        Api::<AutoscalingStrategy>::all(client.clone()),
        watcher_config(),
    );
    let strategies = controller.store();

    tracing::info!("- AutoscalingStrategy controller");

    vec![Box::pin(
        controller
            .watches(Api::<ScalingGroup>::all(client), watcher_config(), move |_| {
                strategies
                    .state()
                    .iter()
                    .map(|s| ObjectRef::from_obj(s.as_ref()))
                    .collect::<Vec<_>>()
            })
            .shutdown_on_signal()
            .run(autoscaling_strategy::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("AutoscalingStrategy", metrics)),
    )]
}

/// Build the JoiningNode controller, requeued when the joining node registers
pub fn build_joining_node_controllers(
    client: Client,
    ctx: Arc<Context>,
    metrics: Arc<Metrics>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let controller = Controller::new(Api::<JoiningNode>::all(client.clone()), watcher_config());
    let joining = controller.store();

    tracing::info!("- JoiningNode controller");

    vec![Box::pin(
        controller
            .watches(Api::<Node>::all(client), watcher_config(), move |node| {
                joining_node::joining_nodes_for_node(&node.name_any(), &joining.state())
            })
            .shutdown_on_signal()
            .run(joining_node::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("JoiningNode", metrics)),
    )]
}

/// Build the scaling-group discovery loop. Every node seen for the first
/// time triggers a discovery pass.
pub fn build_discovery(
    client: Client,
    executor: Executor,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let trigger = executor.trigger_handle();
    let cancel = executor.cancellation_token();

    tracing::info!("- ScalingGroup discovery");

    let shutdown = Box::pin(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    vec![
        Box::pin(executor.run()),
        Box::pin(node_join_trigger(client, trigger)),
        shutdown,
    ]
}

fn node_join_trigger(client: Client, trigger: Arc<Notify>) -> impl Future<Output = ()> + Send {
    let mut seen = HashSet::new();
    watcher::watcher(Api::<Node>::all(client), watcher_config())
        .applied_objects()
        .for_each(move |node| {
            match node {
                Ok(node) => {
                    if seen.insert(node.name_any()) {
                        tracing::debug!(node = %node.name_any(), "New node, triggering discovery");
                        trigger.notify_one();
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Node watch failed"),
            }
            std::future::ready(())
        })
}

/// Creates a closure logging reconcile results and counting them
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
    metrics: Arc<Metrics>,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => {
                metrics.record(controller_name, true);
                tracing::debug!(?action, "{} reconciliation completed", controller_name)
            }
            Err(e) => {
                metrics.record(controller_name, false);
                tracing::error!(error = ?e, "{} reconciliation error", controller_name)
            }
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scaling_group;

    #[test]
    fn scaling_groups_map_to_their_node_version() {
        let group = scaling_group("g1", "g1", "image-2");
        assert_eq!(
            node_version_for_scaling_group(&group).map(|r| r.name),
            Some(NODE_VERSION_RESOURCE_NAME.to_string())
        );

        let mut detached = group.clone();
        detached.spec.node_version = String::new();
        assert!(node_version_for_scaling_group(&detached).is_none());

        let groups = vec![Arc::new(group), Arc::new(detached)];
        let refs = scaling_groups_for_node_version(NODE_VERSION_RESOURCE_NAME, &groups);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "g1");
    }

    #[test]
    fn results_are_counted() {
        let metrics = Arc::new(Metrics::default());
        let log = log_reconcile_result::<(), String>("PendingNode", metrics.clone());
        let _ = log(Ok(()));
        let _ = log(Err("boom".to_string()));
        let counts = metrics.counts("PendingNode");
        assert_eq!((counts.success, counts.failure), (1, 1));
    }
}
