//! Client for the upgrade agent running on control-plane hosts

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use constellation_common::{Error, Result};
use constellation_grpc::Dialer;
use constellation_proto::upgrade::update_client::UpdateClient;
use constellation_proto::upgrade::ExecuteUpdateRequest;

/// Runs a Kubernetes control-plane upgrade
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpgradeAgent: Send + Sync {
    /// Download kubeadm from `kubeadm_url`, check it against `kubeadm_hash`
    /// and upgrade the control plane to `wanted_version`
    async fn upgrade(&self, kubeadm_url: &str, kubeadm_hash: &str, wanted_version: &str)
        -> Result<()>;
}

/// [`UpgradeAgent`] reached over a unix socket
#[derive(Clone, Debug)]
pub struct UpgradeAgentClient {
    socket: PathBuf,
}

impl UpgradeAgentClient {
    /// Client for the agent listening on `socket`
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl UpgradeAgent for UpgradeAgentClient {
    async fn upgrade(
        &self,
        kubeadm_url: &str,
        kubeadm_hash: &str,
        wanted_version: &str,
    ) -> Result<()> {
        let channel = Dialer::dial_unix(&self.socket)
            .map_err(|e| Error::internal_with_context("upgrade_agent", e.to_string()))?;
        UpdateClient::new(channel)
            .execute_update(ExecuteUpdateRequest {
                kubeadm_url: kubeadm_url.to_string(),
                kubeadm_hash: kubeadm_hash.to_string(),
                wanted_kubernetes_version: wanted_version.to_string(),
            })
            .await
            .map_err(|status| {
                Error::internal_with_context("upgrade_agent", status.message().to_string())
            })?;
        info!(version = %wanted_version, "Upgrade agent finished");
        Ok(())
    }
}
