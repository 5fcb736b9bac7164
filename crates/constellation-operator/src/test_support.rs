//! In-memory cluster, cloud and fixtures shared by the reconciler tests

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Node, NodeAddress, NodeCondition, NodeSpec, NodeStatus, PodSpec,
    PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::{Mutex, MutexGuard};

use constellation_common::crd::{
    AutoscalingStrategy, AutoscalingStrategyStatus, CspNodeState, JoiningNode, NodeMaintenance,
    NodeVersion, NodeVersionSpec, NodeVersionStatus, PendingNode, PendingNodeGoal,
    PendingNodeSpec, PendingNodeStatus, ScalingGroup, ScalingGroupSpec, ScalingGroupStatus,
};
use constellation_common::node::{
    COMPONENTS_ANNOTATION, CONTROL_PLANE_LABEL, NODE_IMAGE_ANNOTATION, SCALING_GROUP_ANNOTATION,
};
use constellation_common::{Error, Result, Role, NODE_VERSION_RESOURCE_NAME};

use crate::client::KubeClient;
use crate::controller::Context;
use crate::csp::{CloudProvider, DiscoveredScalingGroup};
use crate::etcd::EtcdRemover;
use crate::upgrade::UpgradeAgent;

// =============================================================================
// Kubernetes
// =============================================================================

/// Objects stored by [`FakeCluster`]
#[derive(Default)]
pub struct ClusterState {
    pub server_version: String,
    pub nodes: BTreeMap<String, Node>,
    pub node_versions: BTreeMap<String, NodeVersion>,
    pub pending: BTreeMap<String, PendingNode>,
    pub scaling_groups: BTreeMap<String, ScalingGroup>,
    pub strategies: BTreeMap<String, AutoscalingStrategy>,
    pub maintenances: BTreeMap<String, NodeMaintenance>,
    pub joining: BTreeMap<String, JoiningNode>,
    pub deployments: BTreeMap<(String, String), Deployment>,
    pub config_maps: BTreeMap<(String, String), ConfigMap>,
}

/// [`KubeClient`] over in-memory maps. Every call holds one lock, so
/// compare-and-swap operations are atomic.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock()
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state().nodes.insert(name, node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().nodes.get(name).cloned()
    }

    pub fn node_version(&self) -> NodeVersion {
        self.state()
            .node_versions
            .get(NODE_VERSION_RESOURCE_NAME)
            .cloned()
            .unwrap_or_else(|| panic!("no NodeVersion"))
    }
}

fn missing(kind: &str, name: &str) -> Error {
    Error::not_found(kind, name)
}

fn named<K: kube::Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn server_version(&self) -> Result<String> {
        Ok(self.state().server_version.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.node(name))
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut state = self.state();
        let node = state.nodes.get_mut(name).ok_or_else(|| missing("node", name))?;
        let current = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(value) => current.insert(key, value),
                None => current.remove(&key),
            };
        }
        Ok(())
    }

    async fn patch_node_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state();
        let node = state.nodes.get_mut(name).ok_or_else(|| missing("node", name))?;
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.state().nodes.remove(name);
        Ok(())
    }

    async fn get_node_version(&self, name: &str) -> Result<Option<NodeVersion>> {
        Ok(self.state().node_versions.get(name).cloned())
    }

    async fn create_node_version(&self, node_version: &NodeVersion) -> Result<bool> {
        let mut state = self.state();
        let name = named(node_version);
        if state.node_versions.contains_key(&name) {
            return Ok(false);
        }
        state.node_versions.insert(name, node_version.clone());
        Ok(true)
    }

    async fn update_node_version_status(
        &self,
        name: &str,
        status: &NodeVersionStatus,
    ) -> Result<()> {
        let mut state = self.state();
        let nv = state
            .node_versions
            .get_mut(name)
            .ok_or_else(|| missing("NodeVersion", name))?;
        let flag = nv.upgrade_in_progress();
        let mut status = status.clone();
        status.active_cluster_version_upgrade = flag;
        nv.status = Some(status);
        Ok(())
    }

    async fn swap_cluster_upgrade_flag(&self, name: &str, from: bool, to: bool) -> Result<bool> {
        let mut state = self.state();
        let nv = state
            .node_versions
            .get_mut(name)
            .ok_or_else(|| missing("NodeVersion", name))?;
        if nv.upgrade_in_progress() != from {
            return Ok(false);
        }
        nv.status
            .get_or_insert_with(Default::default)
            .active_cluster_version_upgrade = to;
        Ok(true)
    }

    async fn list_pending_nodes(&self) -> Result<Vec<PendingNode>> {
        Ok(self.state().pending.values().cloned().collect())
    }

    async fn create_pending_node(&self, pending: &PendingNode) -> Result<()> {
        let mut state = self.state();
        let name = named(pending);
        if state.pending.contains_key(&name) {
            return Err(Error::conflict(name, "already exists"));
        }
        state.pending.insert(name, pending.clone());
        Ok(())
    }

    async fn delete_pending_node(&self, name: &str) -> Result<()> {
        self.state().pending.remove(name);
        Ok(())
    }

    async fn update_pending_node_goal(
        &self,
        name: &str,
        goal: PendingNodeGoal,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state();
        let pending = state
            .pending
            .get_mut(name)
            .ok_or_else(|| missing("PendingNode", name))?;
        pending.spec.goal = goal;
        pending.spec.deadline = deadline;
        Ok(())
    }

    async fn update_pending_node_status(
        &self,
        name: &str,
        status: &PendingNodeStatus,
    ) -> Result<()> {
        let mut state = self.state();
        let pending = state
            .pending
            .get_mut(name)
            .ok_or_else(|| missing("PendingNode", name))?;
        pending.status = Some(status.clone());
        Ok(())
    }

    async fn list_scaling_groups(&self) -> Result<Vec<ScalingGroup>> {
        Ok(self.state().scaling_groups.values().cloned().collect())
    }

    async fn create_scaling_group(&self, group: &ScalingGroup) -> Result<bool> {
        let mut state = self.state();
        let name = named(group);
        if state.scaling_groups.contains_key(&name) {
            return Ok(false);
        }
        state.scaling_groups.insert(name, group.clone());
        Ok(true)
    }

    async fn set_scaling_group_node_group_name(
        &self,
        name: &str,
        node_group_name: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let group = state
            .scaling_groups
            .get_mut(name)
            .ok_or_else(|| missing("ScalingGroup", name))?;
        group.spec.node_group_name = node_group_name.to_string();
        Ok(())
    }

    async fn update_scaling_group_status(
        &self,
        name: &str,
        status: &ScalingGroupStatus,
    ) -> Result<()> {
        let mut state = self.state();
        let group = state
            .scaling_groups
            .get_mut(name)
            .ok_or_else(|| missing("ScalingGroup", name))?;
        group.status = Some(status.clone());
        Ok(())
    }

    async fn delete_scaling_group(&self, name: &str) -> Result<()> {
        self.state().scaling_groups.remove(name);
        Ok(())
    }

    async fn list_autoscaling_strategies(&self) -> Result<Vec<AutoscalingStrategy>> {
        Ok(self.state().strategies.values().cloned().collect())
    }

    async fn create_autoscaling_strategy(&self, strategy: &AutoscalingStrategy) -> Result<bool> {
        let mut state = self.state();
        let name = named(strategy);
        if state.strategies.contains_key(&name) {
            return Ok(false);
        }
        state.strategies.insert(name, strategy.clone());
        Ok(true)
    }

    async fn set_autoscaling_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state();
        let strategy = state
            .strategies
            .get_mut(name)
            .ok_or_else(|| missing("AutoscalingStrategy", name))?;
        strategy.spec.enabled = enabled;
        Ok(())
    }

    async fn update_autoscaling_strategy_status(
        &self,
        name: &str,
        status: &AutoscalingStrategyStatus,
    ) -> Result<()> {
        let mut state = self.state();
        let strategy = state
            .strategies
            .get_mut(name)
            .ok_or_else(|| missing("AutoscalingStrategy", name))?;
        strategy.status = Some(status.clone());
        Ok(())
    }

    async fn get_node_maintenance(&self, name: &str) -> Result<Option<NodeMaintenance>> {
        Ok(self.state().maintenances.get(name).cloned())
    }

    async fn create_node_maintenance(&self, maintenance: &NodeMaintenance) -> Result<()> {
        self.state()
            .maintenances
            .entry(named(maintenance))
            .or_insert_with(|| maintenance.clone());
        Ok(())
    }

    async fn delete_joining_node(&self, name: &str) -> Result<()> {
        self.state().joining.remove(name);
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self
            .state()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        command: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state();
        let deployment = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| missing("deployment", name))?;
        let spec = deployment.spec.get_or_insert_with(Default::default);
        spec.replicas = Some(replicas);
        if let Some(container) = spec
            .template
            .spec
            .as_mut()
            .and_then(|pod| pod.containers.first_mut())
        {
            container.command = Some(command);
        }
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .state()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>> {
        Ok(self
            .state()
            .config_maps
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, cm)| cm.clone())
            .collect())
    }
}

// =============================================================================
// Cloud provider
// =============================================================================

#[derive(Clone, Debug)]
pub struct FakeInstance {
    pub image: String,
    pub group: String,
    pub state: CspNodeState,
}

#[derive(Default)]
pub struct CspState {
    pub instances: BTreeMap<String, FakeInstance>,
    pub group_images: BTreeMap<String, String>,
    pub groups: Vec<DiscoveredScalingGroup>,
    pub created: usize,
    pub deleted: Vec<String>,
    pub image_updates: Vec<(String, String)>,
}

/// [`CloudProvider`] over in-memory instances. Provider IDs are
/// `fake://<node name>`.
#[derive(Clone, Default)]
pub struct FakeCsp {
    state: Arc<Mutex<CspState>>,
}

pub fn provider_id(name: &str) -> String {
    format!("fake://{name}")
}

impl FakeCsp {
    pub fn state(&self) -> MutexGuard<'_, CspState> {
        self.state.lock()
    }

    pub fn add_instance(&self, name: &str, group: &str, image: &str, state: CspNodeState) {
        self.state().instances.insert(
            provider_id(name),
            FakeInstance {
                image: image.to_string(),
                group: group.to_string(),
                state,
            },
        );
    }

    pub fn set_state(&self, name: &str, state: CspNodeState) {
        if let Some(instance) = self.state().instances.get_mut(&provider_id(name)) {
            instance.state = state;
        }
    }

    fn instance(&self, provider_id: &str) -> Result<FakeInstance> {
        self.state()
            .instances
            .get(provider_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", provider_id))
    }
}

#[async_trait]
impl CloudProvider for FakeCsp {
    async fn get_node_image(&self, provider_id: &str) -> Result<String> {
        Ok(self.instance(provider_id)?.image)
    }

    async fn get_scaling_group_id(&self, provider_id: &str) -> Result<String> {
        Ok(self.instance(provider_id)?.group)
    }

    async fn create_node(&self, scaling_group_id: &str) -> Result<(String, String)> {
        let mut state = self.state();
        state.created += 1;
        let name = format!("{scaling_group_id}-new-{}", state.created);
        let image = state
            .group_images
            .get(scaling_group_id)
            .cloned()
            .unwrap_or_default();
        state.instances.insert(
            provider_id(&name),
            FakeInstance {
                image,
                group: scaling_group_id.to_string(),
                state: CspNodeState::Creating,
            },
        );
        Ok((name.clone(), provider_id(&name)))
    }

    async fn delete_node(&self, provider_id: &str) -> Result<()> {
        let mut state = self.state();
        state.deleted.push(provider_id.to_string());
        if let Some(instance) = state.instances.get_mut(provider_id) {
            instance.state = CspNodeState::Terminating;
        }
        Ok(())
    }

    async fn get_node_state(&self, provider_id: &str) -> Result<CspNodeState> {
        Ok(self.instance(provider_id)?.state)
    }

    async fn get_scaling_group_image(&self, scaling_group_id: &str) -> Result<String> {
        self.state()
            .group_images
            .get(scaling_group_id)
            .cloned()
            .ok_or_else(|| Error::not_found("scaling group", scaling_group_id))
    }

    async fn set_scaling_group_image(&self, scaling_group_id: &str, image_uri: &str) -> Result<()> {
        let mut state = self.state();
        state
            .group_images
            .insert(scaling_group_id.to_string(), image_uri.to_string());
        state
            .image_updates
            .push((scaling_group_id.to_string(), image_uri.to_string()));
        Ok(())
    }

    fn get_scaling_group_name(&self, scaling_group_id: &str) -> Result<String> {
        Ok(scaling_group_id.to_lowercase())
    }

    fn get_autoscaling_group_name(&self, scaling_group_id: &str) -> Result<String> {
        Ok(format!("asg-{scaling_group_id}"))
    }

    async fn list_scaling_groups(&self, _uid: &str) -> Result<Vec<DiscoveredScalingGroup>> {
        Ok(self.state().groups.clone())
    }

    fn autoscaling_cloud_provider(&self) -> String {
        "fake".to_string()
    }
}

// =============================================================================
// Control plane agents
// =============================================================================

#[derive(Clone, Default)]
pub struct RecordingEtcd {
    pub removed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EtcdRemover for RecordingEtcd {
    async fn remove_etcd_member(&self, vpc_ip: &str) -> Result<()> {
        self.removed.lock().push(vpc_ip.to_string());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingUpgrade {
    pub calls: Arc<Mutex<Vec<(String, String, String)>>>,
}

#[async_trait]
impl UpgradeAgent for RecordingUpgrade {
    async fn upgrade(&self, url: &str, hash: &str, version: &str) -> Result<()> {
        self.calls
            .lock()
            .push((url.to_string(), hash.to_string(), version.to_string()));
        Ok(())
    }
}

pub fn context(cluster: FakeCluster) -> Context {
    context_with(cluster, FakeCsp::default())
}

pub fn context_with(cluster: FakeCluster, csp: FakeCsp) -> Context {
    Context::new(
        Arc::new(cluster),
        Arc::new(csp),
        Arc::new(RecordingEtcd::default()),
        Arc::new(RecordingUpgrade::default()),
    )
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id(name)),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: "10.0.0.2".to_string(),
            }]),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn with_annotation(mut node: Node, key: &str, value: &str) -> Node {
    node.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    node
}

pub fn with_label(mut node: Node, key: &str, value: &str) -> Node {
    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    node
}

pub fn control_plane(node: Node) -> Node {
    with_label(node, CONTROL_PLANE_LABEL, "")
}

pub fn set_ready(mut node: Node, ready: bool) -> Node {
    if let Some(conditions) = node.status.as_mut().and_then(|s| s.conditions.as_mut()) {
        for condition in conditions.iter_mut().filter(|c| c.type_ == "Ready") {
            condition.status = if ready { "True" } else { "False" }.to_string();
        }
    }
    node
}

pub fn annotated_node(name: &str, image: &str, components: &str, group: &str) -> Node {
    let node = with_annotation(node(name), NODE_IMAGE_ANNOTATION, image);
    let node = with_annotation(node, COMPONENTS_ANNOTATION, components);
    with_annotation(node, SCALING_GROUP_ANNOTATION, group)
}

pub fn pending_node(
    name: &str,
    group: &str,
    goal: PendingNodeGoal,
    state: CspNodeState,
) -> PendingNode {
    let mut pending = PendingNode::new(
        name,
        PendingNodeSpec {
            provider_id: provider_id(name),
            scaling_group_id: group.to_string(),
            node_name: name.to_string(),
            goal,
            deadline: None,
        },
    );
    pending.status = Some(PendingNodeStatus {
        csp_state: state,
        reached_goal: false,
    });
    pending
}

pub fn scaling_group(name: &str, group_id: &str, image: &str) -> ScalingGroup {
    let mut group = ScalingGroup::new(
        name,
        ScalingGroupSpec {
            node_version: NODE_VERSION_RESOURCE_NAME.to_string(),
            group_id: group_id.to_string(),
            autoscaler_group_name: format!("asg-{group_id}"),
            node_group_name: name.to_string(),
            autoscaling: true,
            min: 1,
            max: 10,
            role: Role::Worker,
        },
    );
    group.status = Some(ScalingGroupStatus {
        image_reference: image.to_string(),
        conditions: Vec::new(),
    });
    group
}

pub fn node_version(image: &str, components: &str) -> NodeVersion {
    NodeVersion::new(
        NODE_VERSION_RESOURCE_NAME,
        NodeVersionSpec {
            image_reference: image.to_string(),
            kubernetes_components_reference: components.to_string(),
            ..Default::default()
        },
    )
}

pub fn autoscaler_deployment(namespace: &str, name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "cluster-autoscaler".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(replicas),
            ..Default::default()
        }),
    }
}

pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}
