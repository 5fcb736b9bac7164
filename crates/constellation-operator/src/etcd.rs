//! Removes retired control-plane nodes from the etcd cluster

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::info;

use constellation_common::{Error, Result};
use constellation_proto::etcd::cluster_client::ClusterClient;
use constellation_proto::etcd::{Member, MemberListRequest, MemberRemoveRequest};

/// Directory holding the etcd PKI written by kubeadm
pub const KUBEADM_ETCD_PKI: &str = "/etc/kubernetes/pki/etcd";

/// Client endpoint of the local etcd member
pub const LOCAL_ETCD_ENDPOINT: &str = "127.0.0.1:2379";

const PEER_PORT: u16 = 2380;

/// Removes etcd members
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EtcdRemover: Send + Sync {
    /// Remove the member whose peer URL points at `vpc_ip`. Succeeds if no
    /// such member exists.
    async fn remove_etcd_member(&self, vpc_ip: &str) -> Result<()>;
}

/// Peer URL etcd advertises for a member listening on `ip`
pub fn peer_url(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("https://[{v6}]:{PEER_PORT}"),
        _ => format!("https://{ip}:{PEER_PORT}"),
    }
}

/// ID of the member advertising `vpc_ip` as its peer address
pub fn find_member_id(members: &[Member], vpc_ip: &str) -> Option<u64> {
    let wanted = peer_url(vpc_ip);
    members
        .iter()
        .find(|m| m.peer_ur_ls.iter().any(|url| *url == wanted))
        .map(|m| m.id)
}

fn etcd_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::internal_with_context("etcd", format!("{context}: {e}"))
}

/// [`EtcdRemover`] talking to etcd's Cluster API
#[derive(Clone, Debug)]
pub struct EtcdClient {
    channel: Channel,
}

impl EtcdClient {
    /// Client for `endpoint` authenticated with the kubeadm healthcheck
    /// client certificate from `pki_dir`.
    pub async fn from_kubeadm_pki(pki_dir: impl AsRef<Path>, endpoint: &str) -> Result<Self> {
        let pki_dir = pki_dir.as_ref();
        let read = |name: &str| -> PathBuf { pki_dir.join(name) };
        let ca = tokio::fs::read(read("ca.crt")).await?;
        let cert = tokio::fs::read(read("healthcheck-client.crt")).await?;
        let key = tokio::fs::read(read("healthcheck-client.key")).await?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key))
            .domain_name("localhost");
        let channel = Endpoint::from_shared(format!("https://{endpoint}"))
            .map_err(|e| etcd_error("parsing endpoint", e))?
            .tls_config(tls)
            .map_err(|e| etcd_error("configuring TLS", e))?
            .connect_lazy();
        Ok(Self { channel })
    }

    /// Client on an existing channel
    pub fn with_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl EtcdRemover for EtcdClient {
    async fn remove_etcd_member(&self, vpc_ip: &str) -> Result<()> {
        let mut client = ClusterClient::new(self.channel.clone());
        let members = client
            .member_list(MemberListRequest { linearizable: true })
            .await
            .map_err(|e| etcd_error("listing members", e))?
            .into_inner()
            .members;

        let Some(id) = find_member_id(&members, vpc_ip) else {
            info!(%vpc_ip, "No etcd member to remove");
            return Ok(());
        };
        client
            .member_remove(MemberRemoveRequest { id })
            .await
            .map_err(|e| etcd_error("removing member", e))?;
        info!(%vpc_ip, member = id, "Removed etcd member");
        Ok(())
    }
}
