//! Recovery API served by a rebooting control-plane node
//!
//! The node cannot unlock its state disk on its own after a reboot. It serves
//! `Recover` until an operator pushes the measurement secret and the
//! state-disk key, then shuts the server down. [`crate::recoverer`] races
//! this against fetching the keys from the join service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use constellation_atls::AttestedServerConfig;
use constellation_grpc::transport;
use constellation_proto::recover::api_server::{Api, ApiServer};
use constellation_proto::recover::recover_message::Request as RecoverRequest;
use constellation_proto::recover::{RecoverMessage, RecoverResponse};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use crate::RecoveryError;

/// Secrets needed to unlock the state disk
#[derive(Clone)]
pub struct RecoveredKeys {
    /// Passphrase of the state disk
    pub state_disk_key: Zeroizing<Vec<u8>>,
    /// Cluster measurement secret
    pub measurement_secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for RecoveredKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveredKeys").finish_non_exhaustive()
    }
}

/// Waits for the state-disk key to be pushed to this node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyRecoverer: Send + Sync {
    /// Serve on `listener` until keys for `disk_uuid` arrive or `cancel`
    /// fires. The listener is released before returning.
    async fn serve(
        &self,
        listener: TcpListener,
        disk_uuid: String,
        cancel: CancellationToken,
    ) -> Result<RecoveredKeys, RecoveryError>;
}

/// Serves the `Recover` API over aTLS
#[derive(Clone, Debug)]
pub struct RecoveryServer {
    atls: AttestedServerConfig,
}

impl RecoveryServer {
    /// Server attesting itself with `atls`
    pub fn new(atls: AttestedServerConfig) -> Self {
        Self { atls }
    }
}

#[async_trait]
impl KeyRecoverer for RecoveryServer {
    async fn serve(
        &self,
        listener: TcpListener,
        disk_uuid: String,
        cancel: CancellationToken,
    ) -> Result<RecoveredKeys, RecoveryError> {
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let service = RecoverService {
            disk_uuid,
            done: done_tx,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            finished: Arc::new(AtomicBool::new(false)),
        };

        let received = Arc::new(parking_lot::Mutex::new(None));
        let slot = received.clone();
        let shutdown = async move {
            tokio::select! {
                keys = done_rx.recv() => *slot.lock() = keys,
                _ = cancel.cancelled() => {}
            }
        };

        info!(addr = ?listener.local_addr().ok(), "Serving recovery API");
        Server::builder()
            .add_service(ApiServer::new(service))
            .serve_with_incoming_shutdown(transport::incoming(listener, self.atls.clone()), shutdown)
            .await?;

        let keys = received.lock().take();
        match keys {
            Some(keys) => {
                info!("Received state disk key, recovery server stopped");
                Ok(keys)
            }
            None => Err(RecoveryError::Cancelled),
        }
    }
}

/// Stand-in for worker nodes, which never accept pushed keys
#[derive(Clone, Copy, Debug, Default)]
pub struct StubRecoveryServer;

#[async_trait]
impl KeyRecoverer for StubRecoveryServer {
    async fn serve(
        &self,
        listener: TcpListener,
        _disk_uuid: String,
        cancel: CancellationToken,
    ) -> Result<RecoveredKeys, RecoveryError> {
        drop(listener);
        cancel.cancelled().await;
        Err(RecoveryError::Cancelled)
    }
}

struct RecoverService {
    disk_uuid: String,
    done: mpsc::Sender<RecoveredKeys>,
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Set once keys were handed to the boot path; only read under `lock`
    finished: Arc<AtomicBool>,
}

impl RecoverService {
    /// Runs one exchange, sending the disk UUID on `out`
    async fn exchange(
        disk_uuid: String,
        mut stream: Streaming<RecoverMessage>,
        out: &mpsc::Sender<Result<RecoverResponse, Status>>,
    ) -> Result<RecoveredKeys, Status> {
        let measurement_secret = match next_request(&mut stream).await? {
            Some(RecoverRequest::MeasurementSecret(secret)) => Zeroizing::new(secret),
            _ => {
                return Err(Status::invalid_argument(
                    "first message is not a measurement secret",
                ))
            }
        };

        out.send(Ok(RecoverResponse { disk_uuid }))
            .await
            .map_err(|_| Status::cancelled("client went away"))?;

        let state_disk_key = match next_request(&mut stream).await? {
            Some(RecoverRequest::StateDiskKey(key)) => Zeroizing::new(key),
            _ => {
                return Err(Status::invalid_argument(
                    "second message is not a state disk key",
                ))
            }
        };

        Ok(RecoveredKeys {
            state_disk_key,
            measurement_secret,
        })
    }
}

async fn next_request(
    stream: &mut Streaming<RecoverMessage>,
) -> Result<Option<RecoverRequest>, Status> {
    Ok(stream.message().await?.and_then(|m| m.request))
}

#[tonic::async_trait]
impl Api for RecoverService {
    type RecoverStream = ReceiverStream<Result<RecoverResponse, Status>>;

    async fn recover(
        &self,
        request: Request<Streaming<RecoverMessage>>,
    ) -> Result<Response<Self::RecoverStream>, Status> {
        let (tx, rx) = mpsc::channel(1);
        let stream = request.into_inner();
        let disk_uuid = self.disk_uuid.clone();
        let done = self.done.clone();
        let lock = self.lock.clone();
        let finished = self.finished.clone();

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            info!("Received recover call");
            if finished.load(Ordering::Acquire) {
                warn!("Recovery already finished, rejecting call");
                let _ = tx.send(Err(already_finished())).await;
                return;
            }
            match RecoverService::exchange(disk_uuid, stream, &tx).await {
                Ok(keys) => {
                    // Closing `tx` afterwards half-closes the stream.
                    let delivered =
                        !finished.swap(true, Ordering::AcqRel) && done.send(keys).await.is_ok();
                    if !delivered {
                        warn!("Recovery already finished, dropping keys");
                        let _ = tx.send(Err(already_finished())).await;
                    }
                }
                Err(status) => {
                    warn!(error = %status, "Recover call failed");
                    let _ = tx.send(Err(status)).await;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn already_finished() -> Status {
    Status::failed_precondition("recovery already finished")
}
