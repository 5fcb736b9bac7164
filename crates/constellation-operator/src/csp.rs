//! Cloud provider seam
//!
//! Concrete SDK adapters (GCE managed instance groups, Azure VMSS, AWS
//! auto scaling groups) implement [`CloudProvider`] outside this crate. The
//! operator only ships [`UnsupportedCloudProvider`] for CSPs without node
//! upgrade support.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use constellation_common::crd::CspNodeState;
use constellation_common::{Error, Result, Role};

/// A scaling group as reported by the CSP
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveredScalingGroup {
    /// Name of the ScalingGroup resource to create
    pub name: String,
    /// Name of the node group as shown to users
    pub node_group_name: String,
    /// CSP-specific group ID
    pub group_id: String,
    /// Group name in the format the cluster-autoscaler expects
    pub autoscaling_group_name: String,
    /// Role of the nodes in the group
    pub role: Role,
}

/// Operations the operator needs from a cloud provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Image the instance `provider_id` was created from
    async fn get_node_image(&self, provider_id: &str) -> Result<String>;

    /// Scaling group the instance `provider_id` belongs to
    async fn get_scaling_group_id(&self, provider_id: &str) -> Result<String>;

    /// Create an instance in `scaling_group_id`, returning its future node
    /// name and provider ID
    async fn create_node(&self, scaling_group_id: &str) -> Result<(String, String)>;

    /// Start terminating the instance
    async fn delete_node(&self, provider_id: &str) -> Result<()>;

    /// Lifecycle state of the instance. A missing instance is reported as
    /// a not-found error.
    async fn get_node_state(&self, provider_id: &str) -> Result<CspNodeState>;

    /// Image new instances of the group are created from
    async fn get_scaling_group_image(&self, scaling_group_id: &str) -> Result<String>;

    /// Change the image new instances of the group are created from
    async fn set_scaling_group_image(&self, scaling_group_id: &str, image_uri: &str) -> Result<()>;

    /// Name of the scaling group
    fn get_scaling_group_name(&self, scaling_group_id: &str) -> Result<String>;

    /// Name of the scaling group as the cluster-autoscaler expects it
    fn get_autoscaling_group_name(&self, scaling_group_id: &str) -> Result<String>;

    /// Scaling groups tagged with the cluster `uid`
    async fn list_scaling_groups(&self, uid: &str) -> Result<Vec<DiscoveredScalingGroup>>;

    /// Provider name passed to the cluster-autoscaler
    fn autoscaling_cloud_provider(&self) -> String;
}

/// Placeholder for CSPs that do not support node upgrades.
///
/// Reports one control-plane and one worker group so that initial resources
/// can be deployed. Every mutating call fails.
#[derive(Clone, Debug, Default)]
pub struct UnsupportedCloudProvider;

const UNSUPPORTED: &str = "unsupportedCSP";

impl UnsupportedCloudProvider {
    fn unsupported<T>(operation: &str) -> Result<T> {
        Err(Error::cloud_provider_permanent(format!(
            "{operation} is not supported on this CSP"
        )))
    }
}

#[async_trait]
impl CloudProvider for UnsupportedCloudProvider {
    async fn get_node_image(&self, _provider_id: &str) -> Result<String> {
        Ok(UNSUPPORTED.to_string())
    }

    async fn get_scaling_group_id(&self, _provider_id: &str) -> Result<String> {
        Ok(UNSUPPORTED.to_string())
    }

    async fn create_node(&self, _scaling_group_id: &str) -> Result<(String, String)> {
        Self::unsupported("creating nodes")
    }

    async fn delete_node(&self, _provider_id: &str) -> Result<()> {
        Self::unsupported("deleting nodes")
    }

    async fn get_node_state(&self, _provider_id: &str) -> Result<CspNodeState> {
        Ok(CspNodeState::Unknown)
    }

    async fn get_scaling_group_image(&self, _scaling_group_id: &str) -> Result<String> {
        Ok(UNSUPPORTED.to_string())
    }

    async fn set_scaling_group_image(&self, _scaling_group_id: &str, _image_uri: &str) -> Result<()> {
        Self::unsupported("changing scaling group images")
    }

    fn get_scaling_group_name(&self, scaling_group_id: &str) -> Result<String> {
        Ok(scaling_group_id.to_lowercase())
    }

    fn get_autoscaling_group_name(&self, scaling_group_id: &str) -> Result<String> {
        Ok(scaling_group_id.to_lowercase())
    }

    async fn list_scaling_groups(&self, _uid: &str) -> Result<Vec<DiscoveredScalingGroup>> {
        Ok(vec![
            DiscoveredScalingGroup {
                name: "control-plane-group".to_string(),
                node_group_name: "control_plane_default".to_string(),
                group_id: "control-plane-group".to_string(),
                autoscaling_group_name: "control-plane-group".to_string(),
                role: Role::ControlPlane,
            },
            DiscoveredScalingGroup {
                name: "worker-group".to_string(),
                node_group_name: "worker_default".to_string(),
                group_id: "worker-group".to_string(),
                autoscaling_group_name: "worker-group".to_string(),
                role: Role::Worker,
            },
        ])
    }

    fn autoscaling_cloud_provider(&self) -> String {
        UNSUPPORTED.to_string()
    }
}
