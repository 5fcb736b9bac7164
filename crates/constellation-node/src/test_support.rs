//! Loopback activation server for join and rejoin tests

use std::net::SocketAddr;
use std::sync::Arc;

use constellation_atls::fake::{FakeIssuer, FakeValidator};
use constellation_atls::{AttestedServerConfig, Issuer, Validator, Variant};
use constellation_grpc::{transport, Dialer};
use constellation_proto::activation::api_server::{Api, ApiServer};
use constellation_proto::activation::{
    ActivateControlPlaneNodeRequest, ActivateControlPlaneNodeResponse, ActivateWorkerNodeRequest,
    ActivateWorkerNodeResponse, IssueRejoinTicketRequest, IssueRejoinTicketResponse,
};
use constellation_proto::recover::api_client::ApiClient as RecoverClient;
use constellation_proto::recover::recover_message::Request as RecoverRequest;
use constellation_proto::recover::RecoverMessage;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::metadata::Instance;
use crate::recovery::RecoveredKeys;
use constellation_common::role::Role;

/// Activation server answering with canned credentials
#[derive(Clone, Default)]
pub struct FakeActivation {
    /// `(disk_uuid, node_name)` of every activation request
    pub activations: Arc<Mutex<Vec<(String, String)>>>,
    /// Disk UUIDs of every rejoin request
    pub rejoins: Arc<Mutex<Vec<String>>>,
    /// Fail every call with this status
    pub fail_with: Option<Status>,
}

impl FakeActivation {
    pub fn failing(status: Status) -> Self {
        Self {
            fail_with: Some(status),
            ..Default::default()
        }
    }

    fn check(&self) -> Result<(), Status> {
        match &self.fail_with {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl Api for FakeActivation {
    async fn activate_worker_node(
        &self,
        request: Request<ActivateWorkerNodeRequest>,
    ) -> Result<Response<ActivateWorkerNodeResponse>, Status> {
        self.check()?;
        let req = request.into_inner();
        self.activations.lock().push((req.disk_uuid, req.node_name));
        Ok(Response::new(ActivateWorkerNodeResponse {
            state_disk_key: b"diskKey".to_vec(),
            owner_id: b"ownerID".to_vec(),
            cluster_id: b"clusterID".to_vec(),
            kubelet_key: b"kubeletKey".to_vec(),
            kubelet_cert: b"kubeletCert".to_vec(),
            api_server_endpoint: "192.0.2.3:6443".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            discovery_token_ca_cert_hash: "sha256:00ff".to_string(),
        }))
    }

    async fn activate_control_plane_node(
        &self,
        request: Request<ActivateControlPlaneNodeRequest>,
    ) -> Result<Response<ActivateControlPlaneNodeResponse>, Status> {
        self.check()?;
        let req = request.into_inner();
        self.activations.lock().push((req.disk_uuid, req.node_name));
        Ok(Response::new(ActivateControlPlaneNodeResponse {
            state_disk_key: b"diskKey".to_vec(),
            owner_id: b"ownerID".to_vec(),
            cluster_id: b"clusterID".to_vec(),
            kubelet_key: b"kubeletKey".to_vec(),
            kubelet_cert: b"kubeletCert".to_vec(),
            api_server_endpoint: "192.0.2.3:6443".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            discovery_token_ca_cert_hash: "sha256:00ff".to_string(),
            certificate_key: "cafe".to_string(),
        }))
    }

    async fn issue_rejoin_ticket(
        &self,
        request: Request<IssueRejoinTicketRequest>,
    ) -> Result<Response<IssueRejoinTicketResponse>, Status> {
        self.check()?;
        self.rejoins.lock().push(request.into_inner().disk_uuid);
        Ok(Response::new(IssueRejoinTicketResponse {
            state_disk_key: b"diskKey".to_vec(),
            measurement_secret: b"measurementSecret".to_vec(),
        }))
    }
}

/// Serve `fake` on a loopback port, validating client attestations the way
/// the join service does.
pub async fn spawn_activation(fake: FakeActivation) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let validator: Arc<dyn Validator> = Arc::new(FakeValidator::new(Variant::Dummy));
    let config = AttestedServerConfig::new(None, vec![validator]).unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(ApiServer::new(fake))
            .serve_with_incoming(transport::incoming(listener, config)),
    );
    addr
}

/// Dialer attesting as a node
pub fn node_dialer() -> Dialer {
    let issuer: Arc<dyn Issuer> = Arc::new(FakeIssuer::new(Variant::Dummy));
    Dialer::new(Some(issuer), vec![])
}

pub fn instance(name: &str, role: Role, ips: &[&str]) -> Instance {
    Instance {
        name: name.to_string(),
        role,
        private_ips: ips.iter().map(|s| s.to_string()).collect(),
    }
}

/// Operator side of the recovery exchange: push `keys` to a recovering node
/// and return the disk UUID it reported.
pub async fn push_keys(
    channel: tonic::transport::Channel,
    keys: &RecoveredKeys,
) -> Result<String, Status> {
    let (tx, rx) = mpsc::channel(2);
    let mut client = RecoverClient::new(channel);
    tx.send(RecoverMessage {
        request: Some(RecoverRequest::MeasurementSecret(
            keys.measurement_secret.to_vec(),
        )),
    })
    .await
    .map_err(|_| Status::internal("request stream closed"))?;

    let mut responses = client.recover(ReceiverStream::new(rx)).await?.into_inner();
    let disk_uuid = responses
        .message()
        .await?
        .ok_or_else(|| Status::unavailable("recovery server closed the stream"))?
        .disk_uuid;

    tx.send(RecoverMessage {
        request: Some(RecoverRequest::StateDiskKey(keys.state_disk_key.to_vec())),
    })
    .await
    .map_err(|_| Status::internal("request stream closed"))?;
    drop(tx);

    // Wait for the server to half-close
    while responses.message().await?.is_some() {}
    Ok(disk_uuid)
}
