//! AutoscalingStrategy reconciler
//!
//! Scales the cluster-autoscaler Deployment to one replica while the
//! strategy is enabled and to zero otherwise. The autoscaler command line
//! is regenerated from the ScalingGroups on every pass.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use constellation_common::crd::{
    AutoscalingStrategy, AutoscalingStrategySpec, AutoscalingStrategyStatus, ScalingGroup,
};
use constellation_common::{Result, Role};

use super::Context;

/// Entrypoint of the cluster-autoscaler image
pub const AUTOSCALER_BINARY: &str = "./cluster-autoscaler";

/// Requeue delay after the Deployment was changed
pub const DEPLOYMENT_UPDATE_REQUEUE: Duration = Duration::from_secs(5);

/// Command line of the autoscaler: extra args sorted by key, then one
/// `--nodes` flag per autoscaled worker group
pub fn autoscaler_command(spec: &AutoscalingStrategySpec, groups: &[ScalingGroup]) -> Vec<String> {
    let mut command = vec![AUTOSCALER_BINARY.to_string()];
    command.extend(
        spec.autoscaler_extra_args
            .iter()
            .map(|(key, value)| format!("--{key}={value}")),
    );

    let mut node_args: Vec<String> = groups
        .iter()
        .filter(|g| g.spec.autoscaling && g.spec.role != Role::ControlPlane)
        .map(|g| {
            format!(
                "--nodes={}:{}:{}",
                g.spec.min, g.spec.max, g.spec.autoscaler_group_name
            )
        })
        .collect();
    node_args.sort();
    command.extend(node_args);
    command
}

fn deployment_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or_default()
}

fn deployment_command(deployment: &Deployment) -> Option<&Vec<String>> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .command
        .as_ref()
}

/// Reconcile an AutoscalingStrategy
#[instrument(skip(strategy, ctx), fields(strategy = %strategy.name_any()))]
pub async fn reconcile(strategy: Arc<AutoscalingStrategy>, ctx: Arc<Context>) -> Result<Action> {
    let name = strategy.name_any();
    let spec = &strategy.spec;

    let Some(deployment) = ctx
        .kube
        .get_deployment(&spec.deployment_namespace, &spec.deployment_name)
        .await?
    else {
        debug!(
            namespace = %spec.deployment_namespace,
            deployment = %spec.deployment_name,
            "Autoscaler deployment not found"
        );
        return Ok(Action::await_change());
    };

    let replicas = deployment_replicas(&deployment);
    let status = AutoscalingStrategyStatus {
        enabled: replicas > 0,
        replicas,
    };
    if strategy.status.as_ref() != Some(&status) {
        ctx.kube
            .update_autoscaling_strategy_status(&name, &status)
            .await?;
    }

    let groups = ctx.kube.list_scaling_groups().await?;
    let command = autoscaler_command(spec, &groups);
    let expected = spec.expected_replicas();
    if replicas == expected && deployment_command(&deployment) == Some(&command) {
        return Ok(Action::await_change());
    }

    info!(
        autoscaling_strategy = %name,
        replicas = expected,
        "Updating autoscaler deployment"
    );
    ctx.kube
        .update_deployment(
            &spec.deployment_namespace,
            &spec.deployment_name,
            expected,
            command,
        )
        .await?;
    Ok(Action::requeue(DEPLOYMENT_UPDATE_REQUEUE))
}
