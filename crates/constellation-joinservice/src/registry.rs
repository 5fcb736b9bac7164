//! Registration of joining nodes with the node operator

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use constellation_common::crd::{JoiningNode, JoiningNodeSpec, NodeVersion};
use constellation_common::node::k8s_compliant_hostname;
use constellation_common::NODE_VERSION_RESOURCE_NAME;

use crate::{Result, FIELD_MANAGER};

/// Name of the single JoiningNode used for control-plane joiners
pub const CONTROL_PLANE_JOINING_NODE: &str = "control-plane";

/// How long a control-plane JoiningNode blocks other control-plane joins
pub const CONTROL_PLANE_JOIN_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// How long a worker JoiningNode is kept if the node never registers
pub const WORKER_JOIN_DEADLINE: Duration = Duration::from_secs(48 * 60 * 60);

/// Records nodes that were handed join credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoiningNodeRegistry: Send + Sync {
    /// Register `node_name` with the cluster's current components reference
    async fn add_joining_node(&self, node_name: &str, is_control_plane: bool) -> Result<()>;
}

/// JoiningNode resource for a joiner.
///
/// Workers are named after the node. Control-plane joiners share one name so
/// that only one of them can join at a time.
pub fn joining_node(
    node_name: &str,
    components_reference: &str,
    is_control_plane: bool,
    now: DateTime<Utc>,
) -> Result<JoiningNode> {
    let compliant = k8s_compliant_hostname(node_name)?;
    let (object_name, ttl) = if is_control_plane {
        (CONTROL_PLANE_JOINING_NODE.to_string(), CONTROL_PLANE_JOIN_DEADLINE)
    } else {
        (compliant.clone(), WORKER_JOIN_DEADLINE)
    };
    let deadline = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

    Ok(JoiningNode::new(
        &object_name,
        JoiningNodeSpec {
            name: compliant,
            components_reference: components_reference.to_string(),
            is_control_plane,
            deadline: Some(deadline),
        },
    ))
}

/// Registry writing JoiningNode resources to the API server
#[derive(Clone)]
pub struct KubeRegistry {
    client: Client,
}

impl KubeRegistry {
    /// Registry using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn components_reference(&self) -> Result<String> {
        let versions: Api<NodeVersion> = Api::all(self.client.clone());
        let version = versions.get(NODE_VERSION_RESOURCE_NAME).await?;
        if version.spec.kubernetes_components_reference.is_empty() {
            return Err(constellation_common::Error::validation_for(
                NODE_VERSION_RESOURCE_NAME,
                "kubernetesComponentsReference is not set",
            )
            .into());
        }
        Ok(version.spec.kubernetes_components_reference)
    }
}

#[async_trait]
impl JoiningNodeRegistry for KubeRegistry {
    async fn add_joining_node(&self, node_name: &str, is_control_plane: bool) -> Result<()> {
        let components = self.components_reference().await?;
        let resource = joining_node(node_name, &components, is_control_plane, Utc::now())?;
        let name = resource.metadata.name.clone().unwrap_or_default();
        let api: Api<JoiningNode> = Api::all(self.client.clone());

        if is_control_plane {
            // Fails with a conflict while another control-plane node is joining.
            api.create(&PostParams::default(), &resource).await?;
        } else {
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&resource),
            )
            .await?;
        }
        info!(node = %node_name, joining_node = %name, components = %components, "Registered joining node");
        Ok(())
    }
}
