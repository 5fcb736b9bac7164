//! Resources the operator creates on first start

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tracing::info;

use constellation_common::components::COMPONENTS_CONFIGMAP_PREFIX;
use constellation_common::crd::{
    AutoscalingStrategy, AutoscalingStrategySpec, NodeVersion, NodeVersionSpec,
};
use constellation_common::{
    Error, Result, AUTOSCALING_STRATEGY_RESOURCE_NAME, KUBE_SYSTEM_NAMESPACE,
    NODE_VERSION_RESOURCE_NAME,
};

use crate::client::KubeClient;
use crate::csp::CloudProvider;
use crate::{AUTOSCALER_DEPLOYMENT_NAME, CLUSTER_VERSION_KEY};

/// Create the AutoscalingStrategy and NodeVersion unless they exist.
///
/// The NodeVersion starts out on the image of the first scaling group and
/// the newest `k8s-components-*` ConfigMap.
pub async fn initial_resources(
    kube: &dyn KubeClient,
    csp: &dyn CloudProvider,
    uid: &str,
) -> Result<()> {
    let groups = csp.list_scaling_groups(uid).await?;
    let first = groups
        .first()
        .ok_or_else(|| Error::validation("determining initial node image: no scaling group found"))?;

    let strategy = initial_autoscaling_strategy(&csp.autoscaling_cloud_provider());
    if kube.create_autoscaling_strategy(&strategy).await? {
        info!(name = AUTOSCALING_STRATEGY_RESOURCE_NAME, "Created autoscaling strategy");
    }

    let image = csp.get_scaling_group_image(&first.group_id).await?;
    let config_maps = kube.list_config_maps(KUBE_SYSTEM_NAMESPACE).await?;
    let components = latest_components_config_map(&config_maps)
        .ok_or_else(|| Error::not_found("ConfigMap", format!("{COMPONENTS_CONFIGMAP_PREFIX}*")))?;
    let cluster_version = components
        .data
        .as_ref()
        .and_then(|d| d.get(CLUSTER_VERSION_KEY))
        .cloned()
        .unwrap_or_default();

    let node_version = NodeVersion::new(
        NODE_VERSION_RESOURCE_NAME,
        NodeVersionSpec {
            image_reference: image.clone(),
            kubernetes_components_reference: components.name_any(),
            kubernetes_cluster_version: cluster_version,
            ..Default::default()
        },
    );
    if kube.create_node_version(&node_version).await? {
        info!(image = %image, components = %components.name_any(), "Created node version");
    }
    Ok(())
}

fn initial_autoscaling_strategy(cloud_provider: &str) -> AutoscalingStrategy {
    AutoscalingStrategy::new(
        AUTOSCALING_STRATEGY_RESOURCE_NAME,
        AutoscalingStrategySpec {
            enabled: true,
            deployment_name: AUTOSCALER_DEPLOYMENT_NAME.to_string(),
            deployment_namespace: KUBE_SYSTEM_NAMESPACE.to_string(),
            autoscaler_extra_args: BTreeMap::from([
                ("cloud-provider".to_string(), cloud_provider.to_string()),
                ("logtostderr".to_string(), "true".to_string()),
                ("stderrthreshold".to_string(), "info".to_string()),
                ("v".to_string(), "2".to_string()),
                ("namespace".to_string(), KUBE_SYSTEM_NAMESPACE.to_string()),
            ]),
        },
    )
}

/// Most recently created components ConfigMap
pub fn latest_components_config_map(config_maps: &[ConfigMap]) -> Option<&ConfigMap> {
    config_maps
        .iter()
        .filter(|cm| cm.name_any().starts_with(COMPONENTS_CONFIGMAP_PREFIX))
        .max_by_key(|cm| cm.metadata.creation_timestamp.as_ref().map(|t| t.0))
}
