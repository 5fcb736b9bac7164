//! Cloud instance metadata

use async_trait::async_trait;
use constellation_common::role::Role;
use constellation_common::Result;

#[cfg(test)]
use mockall::automock;

/// One VM of the cluster as reported by the cloud provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instance {
    /// Instance name, also used as the Kubernetes node name
    pub name: String,
    /// Role from the instance's tags
    pub role: Role,
    /// VPC-internal addresses
    pub private_ips: Vec<String>,
}

/// Access to the metadata service of the cloud provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// The instance this code runs on
    async fn self_instance(&self) -> Result<Instance>;

    /// All instances of the cluster
    async fn list(&self) -> Result<Vec<Instance>>;
}

/// `ip:port` of every control-plane address in `instances`, skipping
/// addresses that belong to `me`.
pub fn control_plane_endpoints(instances: &[Instance], me: &Instance, port: u16) -> Vec<String> {
    instances
        .iter()
        .filter(|i| i.role.is_control_plane())
        .flat_map(|i| i.private_ips.iter())
        .filter(|ip| !me.private_ips.contains(ip))
        .map(|ip| join_host_port(ip, port))
        .collect()
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
