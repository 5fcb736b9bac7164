//! gRPC activation service

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tonic::{Request, Response, Status};
use tracing::{error, info};
use zeroize::Zeroizing;

use constellation_common::file::FileHandler;
use constellation_common::id::{ClusterIds, ID_FILENAME};
use constellation_common::{DERIVED_KEY_LENGTH_DEFAULT, MEASUREMENT_SECRET_CONTEXT, STATE_DISK_KEY_LENGTH};
use constellation_kms::KmsClient;
use constellation_proto::activation::api_server::{Api, ApiServer};
use constellation_proto::activation::{
    ActivateControlPlaneNodeRequest, ActivateControlPlaneNodeResponse, ActivateWorkerNodeRequest,
    ActivateWorkerNodeResponse, IssueRejoinTicketRequest, IssueRejoinTicketResponse,
};

use crate::ca::{CertificateAuthority, KubeletCredentials};
use crate::registry::JoiningNodeRegistry;
use crate::token::{BootstrapDiscovery, JoinTokenGetter};
use crate::{Result, JOIN_TOKEN_TTL};

/// Retrieves keys derived by the KMS
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataKeyGetter: Send + Sync {
    /// Key for `key_id`, `length` bytes long
    async fn get_data_key(&self, key_id: &str, length: usize) -> Result<Zeroizing<Vec<u8>>>;
}

#[async_trait]
impl DataKeyGetter for KmsClient {
    async fn get_data_key(&self, key_id: &str, length: usize) -> Result<Zeroizing<Vec<u8>>> {
        Ok(KmsClient::get_data_key(self, key_id, length).await?)
    }
}

/// Collaborators of the activation service
pub struct ActivationServer {
    files: FileHandler,
    keys: Arc<dyn DataKeyGetter>,
    tokens: Arc<dyn JoinTokenGetter>,
    ca: Arc<dyn CertificateAuthority>,
    registry: Arc<dyn JoiningNodeRegistry>,
}

/// Credentials shared by worker and control-plane activations
struct NodeParameters {
    state_disk_key: Zeroizing<Vec<u8>>,
    ids: ClusterIds,
    discovery: BootstrapDiscovery,
    kubelet: KubeletCredentials,
}

impl NodeParameters {
    fn ca_cert_hash(&self) -> String {
        self.discovery.ca_cert_hashes.first().cloned().unwrap_or_default()
    }
}

/// Log the cause, return a status without it
fn internal(context: &str, err: impl std::fmt::Display) -> Status {
    error!(error = %err, "{context}");
    Status::internal(context.to_string())
}

impl ActivationServer {
    /// Server reading the cluster identity from `base_path`
    pub fn new(
        base_path: impl Into<PathBuf>,
        keys: Arc<dyn DataKeyGetter>,
        tokens: Arc<dyn JoinTokenGetter>,
        ca: Arc<dyn CertificateAuthority>,
        registry: Arc<dyn JoiningNodeRegistry>,
    ) -> Self {
        Self {
            files: FileHandler::new(base_path),
            keys,
            tokens,
            ca,
            registry,
        }
    }

    /// Wrap into a tonic service
    pub fn into_service(self) -> ApiServer<Self> {
        ApiServer::new(self)
    }

    async fn activate_node(
        &self,
        disk_uuid: &str,
        node_name: &str,
        is_control_plane: bool,
    ) -> std::result::Result<NodeParameters, Status> {
        let ids: ClusterIds = self
            .files
            .read_json(ID_FILENAME)
            .map_err(|e| internal("unable to load IDs", e))?;

        let state_disk_key = self
            .keys
            .get_data_key(disk_uuid, STATE_DISK_KEY_LENGTH)
            .await
            .map_err(|e| internal("unable to get key for stateful disk", e))?;

        let discovery = self
            .tokens
            .get_join_token(JOIN_TOKEN_TTL)
            .await
            .map_err(|e| internal("unable to generate Kubernetes join arguments", e))?;
        if discovery.ca_cert_hashes.is_empty() {
            return Err(internal(
                "unable to generate Kubernetes join arguments",
                "no CA certificate hash",
            ));
        }

        let kubelet = self
            .ca
            .get_certificate(node_name)
            .map_err(|e| internal("unable to generate kubelet certificate", e))?;

        self.registry
            .add_joining_node(node_name, is_control_plane)
            .await
            .map_err(|e| internal("unable to add node to joining nodes", e))?;

        Ok(NodeParameters {
            state_disk_key,
            ids,
            discovery,
            kubelet,
        })
    }
}

#[tonic::async_trait]
impl Api for ActivationServer {
    async fn activate_worker_node(
        &self,
        request: Request<ActivateWorkerNodeRequest>,
    ) -> std::result::Result<Response<ActivateWorkerNodeResponse>, Status> {
        let req = request.into_inner();
        info!(node = %req.node_name, disk = %req.disk_uuid, "ActivateWorkerNode called");

        let params = self
            .activate_node(&req.disk_uuid, &req.node_name, false)
            .await?;
        let ca_cert_hash = params.ca_cert_hash();

        info!(node = %req.node_name, "ActivateWorkerNode successful");
        Ok(Response::new(ActivateWorkerNodeResponse {
            state_disk_key: params.state_disk_key.to_vec(),
            owner_id: params.ids.owner,
            cluster_id: params.ids.cluster,
            kubelet_key: params.kubelet.key_pem.to_vec(),
            kubelet_cert: params.kubelet.cert_pem,
            api_server_endpoint: params.discovery.api_server_endpoint,
            token: params.discovery.token,
            discovery_token_ca_cert_hash: ca_cert_hash,
        }))
    }

    async fn activate_control_plane_node(
        &self,
        request: Request<ActivateControlPlaneNodeRequest>,
    ) -> std::result::Result<Response<ActivateControlPlaneNodeResponse>, Status> {
        let req = request.into_inner();
        info!(node = %req.node_name, disk = %req.disk_uuid, "ActivateControlPlaneNode called");

        let params = self
            .activate_node(&req.disk_uuid, &req.node_name, true)
            .await?;
        let certificate_key = self
            .tokens
            .get_control_plane_certificate_key()
            .await
            .map_err(|e| internal("unable to get control-plane certificate key", e))?;
        let ca_cert_hash = params.ca_cert_hash();

        info!(node = %req.node_name, "ActivateControlPlaneNode successful");
        Ok(Response::new(ActivateControlPlaneNodeResponse {
            state_disk_key: params.state_disk_key.to_vec(),
            owner_id: params.ids.owner,
            cluster_id: params.ids.cluster,
            kubelet_key: params.kubelet.key_pem.to_vec(),
            kubelet_cert: params.kubelet.cert_pem,
            api_server_endpoint: params.discovery.api_server_endpoint,
            token: params.discovery.token,
            discovery_token_ca_cert_hash: ca_cert_hash,
            certificate_key,
        }))
    }

    async fn issue_rejoin_ticket(
        &self,
        request: Request<IssueRejoinTicketRequest>,
    ) -> std::result::Result<Response<IssueRejoinTicketResponse>, Status> {
        let req = request.into_inner();
        info!(disk = %req.disk_uuid, "IssueRejoinTicket called");

        let measurement_secret = self
            .keys
            .get_data_key(MEASUREMENT_SECRET_CONTEXT, DERIVED_KEY_LENGTH_DEFAULT)
            .await
            .map_err(|e| internal("unable to get measurement secret", e))?;
        let state_disk_key = self
            .keys
            .get_data_key(&req.disk_uuid, STATE_DISK_KEY_LENGTH)
            .await
            .map_err(|e| internal("unable to get key for stateful disk", e))?;

        info!(disk = %req.disk_uuid, "IssueRejoinTicket successful");
        Ok(Response::new(IssueRejoinTicketResponse {
            state_disk_key: state_disk_key.to_vec(),
            measurement_secret: measurement_secret.to_vec(),
        }))
    }
}
