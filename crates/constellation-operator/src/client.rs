//! Kubernetes API seam of the operator
//!
//! Reconcilers only talk to the API server through [`KubeClient`] so that
//! they can be driven against mocks or the in-memory cluster used in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use constellation_common::crd::{
    AutoscalingStrategy, AutoscalingStrategyStatus, JoiningNode, NodeMaintenance, NodeVersion,
    NodeVersionStatus, PendingNode, PendingNodeGoal, PendingNodeStatus, ScalingGroup,
    ScalingGroupStatus,
};
use constellation_common::retry::retry_on_conflict;
use constellation_common::{Error, Result};

use crate::FIELD_MANAGER;

/// Trait abstracting the Kubernetes operations of the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Git version of the API server, e.g. `v1.29.0`
    async fn server_version(&self) -> Result<String>;

    /// All nodes of the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Get a node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Set (`Some`) or remove (`None`) node annotations
    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// Merge labels into a node
    async fn patch_node_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    /// Delete a node object. Deleting a missing node succeeds.
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Get a NodeVersion by name
    async fn get_node_version(&self, name: &str) -> Result<Option<NodeVersion>>;

    /// Create a NodeVersion. Returns false if it already exists.
    async fn create_node_version(&self, node_version: &NodeVersion) -> Result<bool>;

    /// Write the node classification into the NodeVersion status.
    ///
    /// Never touches the cluster-upgrade flag, which is only changed through
    /// [`KubeClient::swap_cluster_upgrade_flag`].
    async fn update_node_version_status(&self, name: &str, status: &NodeVersionStatus)
        -> Result<()>;

    /// Atomically change `activeClusterVersionUpgrade` from `from` to `to`.
    ///
    /// Returns false if the flag did not hold `from` or another writer got
    /// there first.
    async fn swap_cluster_upgrade_flag(&self, name: &str, from: bool, to: bool) -> Result<bool>;

    /// All PendingNodes
    async fn list_pending_nodes(&self) -> Result<Vec<PendingNode>>;

    /// Create a PendingNode
    async fn create_pending_node(&self, pending: &PendingNode) -> Result<()>;

    /// Delete a PendingNode. Deleting a missing one succeeds.
    async fn delete_pending_node(&self, name: &str) -> Result<()>;

    /// Change goal and deadline of a PendingNode
    async fn update_pending_node_goal(
        &self,
        name: &str,
        goal: PendingNodeGoal,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Write the status of a PendingNode
    async fn update_pending_node_status(&self, name: &str, status: &PendingNodeStatus)
        -> Result<()>;

    /// All ScalingGroups
    async fn list_scaling_groups(&self) -> Result<Vec<ScalingGroup>>;

    /// Create a ScalingGroup. Returns false if it already exists.
    async fn create_scaling_group(&self, group: &ScalingGroup) -> Result<bool>;

    /// Change the user-facing node group name of a ScalingGroup
    async fn set_scaling_group_node_group_name(&self, name: &str, node_group_name: &str)
        -> Result<()>;

    /// Write the status of a ScalingGroup
    async fn update_scaling_group_status(&self, name: &str, status: &ScalingGroupStatus)
        -> Result<()>;

    /// Delete a ScalingGroup. Deleting a missing one succeeds.
    async fn delete_scaling_group(&self, name: &str) -> Result<()>;

    /// All AutoscalingStrategies
    async fn list_autoscaling_strategies(&self) -> Result<Vec<AutoscalingStrategy>>;

    /// Create an AutoscalingStrategy. Returns false if it already exists.
    async fn create_autoscaling_strategy(&self, strategy: &AutoscalingStrategy) -> Result<bool>;

    /// Turn the cluster-autoscaler on or off
    async fn set_autoscaling_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    /// Write the status of an AutoscalingStrategy
    async fn update_autoscaling_strategy_status(
        &self,
        name: &str,
        status: &AutoscalingStrategyStatus,
    ) -> Result<()>;

    /// Get a NodeMaintenance by name
    async fn get_node_maintenance(&self, name: &str) -> Result<Option<NodeMaintenance>>;

    /// Create a NodeMaintenance. An existing one is left alone.
    async fn create_node_maintenance(&self, maintenance: &NodeMaintenance) -> Result<()>;

    /// Delete a JoiningNode. Deleting a missing one succeeds.
    async fn delete_joining_node(&self, name: &str) -> Result<()>;

    /// Get a deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Set replicas and the command of the first container of a deployment
    async fn update_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        command: Vec<String>,
    ) -> Result<()>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// All ConfigMaps of a namespace
    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>>;
}

/// [`KubeClient`] backed by the API server
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER)
    }
}

fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn created<T>(result: std::result::Result<T, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Status patch for the classification that leaves the upgrade flag alone
pub(crate) fn node_version_status_patch(status: &NodeVersionStatus) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("activeClusterVersionUpgrade");
    }
    Ok(serde_json::json!({ "status": value }))
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_node_version(&self, name: &str) -> Result<Option<NodeVersion>> {
        let api: Api<NodeVersion> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_node_version(&self, node_version: &NodeVersion) -> Result<bool> {
        let api: Api<NodeVersion> = Api::all(self.client.clone());
        created(api.create(&PostParams::default(), node_version).await)
    }

    async fn update_node_version_status(
        &self,
        name: &str,
        status: &NodeVersionStatus,
    ) -> Result<()> {
        let api: Api<NodeVersion> = Api::all(self.client.clone());
        let patch = node_version_status_patch(status)?;
        api.patch_status(name, &Self::params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn swap_cluster_upgrade_flag(&self, name: &str, from: bool, to: bool) -> Result<bool> {
        let api: Api<NodeVersion> = Api::all(self.client.clone());
        let current = api.get(name).await?;
        if current.upgrade_in_progress() != from {
            return Ok(false);
        }
        // The resourceVersion turns the merge patch into a compare-and-swap.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": current.metadata.resource_version },
            "status": { "activeClusterVersionUpgrade": to },
        });
        match api
            .patch_status(name, &Self::params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(node_version = %name, "Lost race on cluster upgrade flag");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pending_nodes(&self) -> Result<Vec<PendingNode>> {
        let api: Api<PendingNode> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_pending_node(&self, pending: &PendingNode) -> Result<()> {
        let api: Api<PendingNode> = Api::all(self.client.clone());
        api.create(&PostParams::default(), pending).await?;
        Ok(())
    }

    async fn delete_pending_node(&self, name: &str) -> Result<()> {
        let api: Api<PendingNode> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn update_pending_node_goal(
        &self,
        name: &str,
        goal: PendingNodeGoal,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let api: Api<PendingNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "goal": goal, "deadline": deadline } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_pending_node_status(
        &self,
        name: &str,
        status: &PendingNodeStatus,
    ) -> Result<()> {
        constellation_common::kube_utils::patch_cluster_status::<PendingNode>(
            &self.client,
            name,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn list_scaling_groups(&self) -> Result<Vec<ScalingGroup>> {
        let api: Api<ScalingGroup> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_scaling_group(&self, group: &ScalingGroup) -> Result<bool> {
        let api: Api<ScalingGroup> = Api::all(self.client.clone());
        created(api.create(&PostParams::default(), group).await)
    }

    async fn set_scaling_group_node_group_name(
        &self,
        name: &str,
        node_group_name: &str,
    ) -> Result<()> {
        let api: Api<ScalingGroup> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "nodeGroupName": node_group_name } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_scaling_group_status(
        &self,
        name: &str,
        status: &ScalingGroupStatus,
    ) -> Result<()> {
        constellation_common::kube_utils::patch_cluster_status::<ScalingGroup>(
            &self.client,
            name,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn delete_scaling_group(&self, name: &str) -> Result<()> {
        let api: Api<ScalingGroup> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn list_autoscaling_strategies(&self) -> Result<Vec<AutoscalingStrategy>> {
        let api: Api<AutoscalingStrategy> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_autoscaling_strategy(&self, strategy: &AutoscalingStrategy) -> Result<bool> {
        let api: Api<AutoscalingStrategy> = Api::all(self.client.clone());
        created(api.create(&PostParams::default(), strategy).await)
    }

    async fn set_autoscaling_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let api: Api<AutoscalingStrategy> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "enabled": enabled } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_autoscaling_strategy_status(
        &self,
        name: &str,
        status: &AutoscalingStrategyStatus,
    ) -> Result<()> {
        constellation_common::kube_utils::patch_cluster_status::<AutoscalingStrategy>(
            &self.client,
            name,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn get_node_maintenance(&self, name: &str) -> Result<Option<NodeMaintenance>> {
        let api: Api<NodeMaintenance> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_node_maintenance(&self, maintenance: &NodeMaintenance) -> Result<()> {
        let api: Api<NodeMaintenance> = Api::all(self.client.clone());
        created(api.create(&PostParams::default(), maintenance).await)?;
        Ok(())
    }

    async fn delete_joining_node(&self, name: &str) -> Result<()> {
        let api: Api<JoiningNode> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        command: Vec<String>,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        retry_on_conflict("update_deployment", || {
            let api = api.clone();
            let command = command.clone();
            async move {
                let mut deployment = api.get(name).await?;
                let spec = deployment
                    .spec
                    .as_mut()
                    .ok_or_else(|| Error::validation_for(name, "deployment has no spec"))?;
                spec.replicas = Some(replicas);
                if let Some(container) = spec
                    .template
                    .spec
                    .as_mut()
                    .and_then(|pod| pod.containers.first_mut())
                {
                    container.command = Some(command);
                }
                api.replace(name, &PostParams::default(), &deployment)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}
