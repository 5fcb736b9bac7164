//! KMS gRPC server on a plain and an attested listener

use std::sync::Arc;

use constellation_atls::AttestedServerConfig;
use constellation_grpc::transport;
use constellation_proto::kms::api_server::{Api, ApiServer};
use constellation_proto::kms::{GetDataKeyRequest, GetDataKeyResponse};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::{KmsBackend, KmsError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// gRPC handler for `kms.API`
pub struct KmsService {
    backend: Arc<dyn KmsBackend>,
}

#[tonic::async_trait]
impl Api for KmsService {
    async fn get_data_key(
        &self,
        request: Request<GetDataKeyRequest>,
    ) -> Result<Response<GetDataKeyResponse>, Status> {
        let req = request.into_inner();
        if req.length == 0 {
            return Err(Status::invalid_argument("can't derive key with length zero"));
        }
        if req.data_key_id.is_empty() {
            return Err(Status::invalid_argument("no data key ID specified"));
        }

        let key = self
            .backend
            .get_dek(&req.data_key_id, req.length as usize)
            .await
            .map_err(|e| match e {
                KmsError::InvalidRequest { message } => Status::invalid_argument(message),
                other => {
                    error!(key_id = %req.data_key_id, error = %other, "Failed to derive key");
                    Status::internal("getting data key")
                }
            })?;
        info!(key_id = %req.data_key_id, length = req.length, "Derived data key");

        Ok(Response::new(GetDataKeyResponse {
            data_key: key.to_vec(),
        }))
    }
}

/// Serves one backend on an in-cluster plain listener and an external
/// attested listener.
pub struct KmsServer {
    backend: Arc<dyn KmsBackend>,
    atls: AttestedServerConfig,
}

impl KmsServer {
    /// Server handing out keys from `backend`, attesting with `atls`
    pub fn new(backend: Arc<dyn KmsBackend>, atls: AttestedServerConfig) -> Self {
        Self { backend, atls }
    }

    /// gRPC service wrapping the backend
    pub fn service(&self) -> ApiServer<KmsService> {
        ApiServer::new(KmsService {
            backend: self.backend.clone(),
        })
    }

    /// Serve until `shutdown` is cancelled or a listener fails.
    ///
    /// The first listener to stop takes the other one down with it and its
    /// error, if any, is returned.
    pub async fn serve(
        &self,
        plain: TcpListener,
        attested: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), KmsError> {
        info!(
            plain = ?plain.local_addr().ok(),
            attested = ?attested.local_addr().ok(),
            "Starting KMS server"
        );
        self.serve_incoming(
            TcpListenerStream::new(plain),
            transport::incoming(attested, self.atls.clone()),
            shutdown,
        )
        .await
    }

    async fn serve_incoming<P, PIO, PE, A, AIO, AE>(
        &self,
        plain: P,
        attested: A,
        shutdown: CancellationToken,
    ) -> Result<(), KmsError>
    where
        P: Stream<Item = Result<PIO, PE>>,
        PIO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        PIO::ConnectInfo: Clone + Send + Sync + 'static,
        PE: Into<BoxError>,
        A: Stream<Item = Result<AIO, AE>>,
        AIO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        AIO::ConnectInfo: Clone + Send + Sync + 'static,
        AE: Into<BoxError>,
    {
        let stop = shutdown.child_token();

        let plain_server = async {
            let result = Server::builder()
                .add_service(self.service())
                .serve_with_incoming_shutdown(plain, stop.cancelled())
                .await;
            info!("Plain listener stopped");
            stop.cancel();
            result
        };
        let attested_server = async {
            let result = Server::builder()
                .add_service(self.service())
                .serve_with_incoming_shutdown(attested, stop.cancelled())
                .await;
            info!("Attested listener stopped");
            stop.cancel();
            result
        };

        tokio::try_join!(plain_server, attested_server)?;
        info!("KMS server stopped");
        Ok(())
    }
}
