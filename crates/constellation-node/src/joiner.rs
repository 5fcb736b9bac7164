//! Handing join credentials to kubeadm

use std::path::PathBuf;

use async_trait::async_trait;
use constellation_common::kubeadm::BootstrapDiscovery;
use constellation_common::role::Role;
use constellation_common::{Error, Result};
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// Joins this node to an existing Kubernetes cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterJoiner: Send + Sync {
    /// Join using `discovery`. Control-plane nodes also need the key that
    /// decrypts the shared control-plane certificates.
    async fn join_cluster(
        &self,
        discovery: &BootstrapDiscovery,
        certificate_key: Option<String>,
        role: Role,
    ) -> Result<()>;
}

/// Runs `kubeadm join`
#[derive(Clone, Debug)]
pub struct KubeadmJoiner {
    kubeadm: PathBuf,
}

impl KubeadmJoiner {
    /// Joiner invoking the given kubeadm binary
    pub fn new(kubeadm: impl Into<PathBuf>) -> Self {
        Self {
            kubeadm: kubeadm.into(),
        }
    }
}

/// Command line for `kubeadm join`
pub fn join_args(
    discovery: &BootstrapDiscovery,
    certificate_key: Option<&str>,
    role: Role,
) -> Result<Vec<String>> {
    let mut args = vec![
        "join".to_string(),
        discovery.api_server_endpoint.clone(),
        "--token".to_string(),
        discovery.token.clone(),
    ];
    for hash in &discovery.ca_cert_hashes {
        args.push("--discovery-token-ca-cert-hash".to_string());
        args.push(hash.clone());
    }
    match (role, certificate_key) {
        (Role::Worker, _) => {}
        (Role::ControlPlane, Some(key)) if !key.is_empty() => {
            args.push("--control-plane".to_string());
            args.push("--certificate-key".to_string());
            args.push(key.to_string());
        }
        (Role::ControlPlane, _) => {
            return Err(Error::validation(
                "control-plane join requires a certificate key",
            ))
        }
        (Role::Unknown, _) => return Err(Error::validation("cannot join with unknown role")),
    }
    Ok(args)
}

#[async_trait]
impl ClusterJoiner for KubeadmJoiner {
    async fn join_cluster(
        &self,
        discovery: &BootstrapDiscovery,
        certificate_key: Option<String>,
        role: Role,
    ) -> Result<()> {
        let args = join_args(discovery, certificate_key.as_deref(), role)?;
        info!(endpoint = %discovery.api_server_endpoint, %role, "Running kubeadm join");
        let output = Command::new(&self.kubeadm).args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::internal_with_context(
                "kubeadm join",
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}
