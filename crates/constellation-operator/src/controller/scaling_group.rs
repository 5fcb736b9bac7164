//! ScalingGroup reconciler
//!
//! Points the CSP group at the image declared in the NodeVersion so that new
//! instances come up on the target image.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use constellation_common::crd::{
    set_condition, Condition, ConditionStatus, ScalingGroup, ScalingGroupStatus,
    CONDITION_OUTDATED, SCALING_GROUP_IMAGE_OUT_OF_DATE_MESSAGE,
    SCALING_GROUP_IMAGE_OUT_OF_DATE_REASON, SCALING_GROUP_IMAGE_UP_TO_DATE_MESSAGE,
    SCALING_GROUP_IMAGE_UP_TO_DATE_REASON,
};
use constellation_common::{Error, Result};

use super::Context;

/// Requeue delay while the CSP group still uses another image
pub const IMAGE_UPDATE_REQUEUE: Duration = Duration::from_secs(10);

/// Status for a group whose CSP image is `observed` when `desired` is wanted
pub fn scaling_group_status(
    previous: Option<&ScalingGroupStatus>,
    observed: &str,
    desired: &str,
) -> ScalingGroupStatus {
    let outdated = !observed.eq_ignore_ascii_case(desired);
    let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    let condition = if outdated {
        Condition::new(
            CONDITION_OUTDATED,
            ConditionStatus::True,
            SCALING_GROUP_IMAGE_OUT_OF_DATE_REASON,
            SCALING_GROUP_IMAGE_OUT_OF_DATE_MESSAGE,
        )
    } else {
        Condition::new(
            CONDITION_OUTDATED,
            ConditionStatus::False,
            SCALING_GROUP_IMAGE_UP_TO_DATE_REASON,
            SCALING_GROUP_IMAGE_UP_TO_DATE_MESSAGE,
        )
    };
    set_condition(&mut conditions, condition);
    ScalingGroupStatus {
        image_reference: observed.to_string(),
        conditions,
    }
}

/// Reconcile a ScalingGroup
#[instrument(skip(group, ctx), fields(scaling_group = %group.name_any()))]
pub async fn reconcile(group: Arc<ScalingGroup>, ctx: Arc<Context>) -> Result<Action> {
    let name = group.name_any();
    let node_version = ctx
        .kube
        .get_node_version(&group.spec.node_version)
        .await?
        .ok_or_else(|| Error::not_found("NodeVersion", &group.spec.node_version))?;
    let desired = &node_version.spec.image_reference;

    let observed = ctx
        .csp
        .get_scaling_group_image(&group.spec.group_id)
        .await?;
    let up_to_date = observed.eq_ignore_ascii_case(desired);
    if !up_to_date {
        info!(scaling_group = %name, from = %observed, to = %desired, "Updating scaling group image");
        ctx.csp
            .set_scaling_group_image(&group.spec.group_id, desired)
            .await?;
    }

    let status = scaling_group_status(group.status.as_ref(), &observed, desired);
    ctx.kube.update_scaling_group_status(&name, &status).await?;

    if up_to_date {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(IMAGE_UPDATE_REQUEUE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context_with, node_version, scaling_group, FakeCluster, FakeCsp};
    use constellation_common::crd::find_condition;
    use constellation_common::NODE_VERSION_RESOURCE_NAME;

    fn setup(csp_image: &str) -> (FakeCluster, FakeCsp, Arc<Context>) {
        let cluster = FakeCluster::default();
        cluster.state().node_versions.insert(
            NODE_VERSION_RESOURCE_NAME.to_string(),
            node_version("image-2", "k8s-components-2"),
        );
        cluster
            .state()
            .scaling_groups
            .insert("g1".to_string(), scaling_group("g1", "g1", ""));
        let csp = FakeCsp::default();
        csp.state()
            .group_images
            .insert("g1".to_string(), csp_image.to_string());
        let ctx = Arc::new(context_with(cluster.clone(), csp.clone()));
        (cluster, csp, ctx)
    }

    fn group(cluster: &FakeCluster) -> ScalingGroup {
        cluster.state().scaling_groups["g1"].clone()
    }

    #[tokio::test]
    async fn outdated_group_is_pointed_at_target_image() {
        let (cluster, csp, ctx) = setup("image-1");

        let action = reconcile(Arc::new(group(&cluster)), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(IMAGE_UPDATE_REQUEUE));
        assert_eq!(
            csp.state().image_updates,
            vec![("g1".to_string(), "image-2".to_string())]
        );
        let status = group(&cluster).status.unwrap();
        assert_eq!(status.image_reference, "image-1");
        let outdated = find_condition(&status.conditions, CONDITION_OUTDATED).unwrap();
        assert_eq!(outdated.status, ConditionStatus::True);

        // Next pass observes the new image
        let action = reconcile(Arc::new(group(&cluster)), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        let status = group(&cluster).status.unwrap();
        assert_eq!(status.image_reference, "image-2");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn image_comparison_ignores_case() {
        let (cluster, csp, ctx) = setup("IMAGE-2");
        reconcile(Arc::new(group(&cluster)), ctx).await.unwrap();
        assert!(csp.state().image_updates.is_empty());
    }

    #[tokio::test]
    async fn missing_node_version_is_an_error() {
        let (cluster, _csp, ctx) = setup("image-1");
        cluster.state().node_versions.clear();
        let err = reconcile(Arc::new(group(&cluster)), ctx).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
