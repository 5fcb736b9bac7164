//! Unlocking the state disk after a reboot
//!
//! Keys can arrive two ways: pushed by an operator through the recovery API,
//! or fetched from a control-plane peer with a rejoin ticket. Both run at the
//! same time and whichever finishes first wins.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::recovery::{KeyRecoverer, RecoveredKeys};
use crate::rejoin::RejoinClient;
use crate::RecoveryError;

/// Races the recovery server against the rejoin client
#[derive(Clone)]
pub struct NodeRecoverer {
    server: Arc<dyn KeyRecoverer>,
    rejoin: RejoinClient,
}

impl NodeRecoverer {
    /// Recoverer using `server` for pushed keys and `rejoin` for fetched ones
    pub fn new(server: Arc<dyn KeyRecoverer>, rejoin: RejoinClient) -> Self {
        Self { server, rejoin }
    }

    /// Obtain the keys for `disk_uuid`. Both sources are stopped and the
    /// listener is released before this returns.
    pub async fn recover(
        &self,
        listener: TcpListener,
        disk_uuid: &str,
        cancel: CancellationToken,
    ) -> Result<RecoveredKeys, RecoveryError> {
        let stop = cancel.child_token();

        let serve = self.server.serve(listener, disk_uuid.to_string(), stop.clone());
        let rejoin = self.rejoin.run(disk_uuid, stop.clone());
        tokio::pin!(serve, rejoin);

        tokio::select! {
            served = &mut serve => {
                stop.cancel();
                rejoin.await;
                if served.is_ok() {
                    info!("State disk key pushed through recovery API");
                }
                served
            }
            fetched = &mut rejoin => {
                stop.cancel();
                let served = serve.await;
                match (fetched, served) {
                    (Some(keys), _) => {
                        info!("State disk key fetched with rejoin ticket");
                        Ok(keys)
                    }
                    (None, served) => served,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MockMetadataApi;
    use crate::recovery::{MockKeyRecoverer, RecoveryServer, StubRecoveryServer};
    use crate::test_support::{instance, node_dialer, push_keys, spawn_activation, FakeActivation};
    use constellation_atls::fake::FakeIssuer;
    use constellation_atls::{AttestedServerConfig, Issuer, Variant};
    use constellation_common::role::Role;
    use constellation_common::Error;
    use constellation_grpc::Dialer;
    use std::time::Duration;
    use zeroize::Zeroizing;

    fn unreachable_peers() -> MockMetadataApi {
        let mut metadata = MockMetadataApi::new();
        metadata
            .expect_list()
            .returning(|| Err(Error::cloud_provider("metadata server down")));
        metadata
    }

    fn rejoin(metadata: MockMetadataApi, port: u16) -> RejoinClient {
        RejoinClient::new(
            instance("cp-1", Role::ControlPlane, &["10.0.0.5"]),
            node_dialer(),
            Arc::new(metadata),
        )
        .with_timing(Duration::from_millis(20), Duration::from_secs(5))
        .with_join_port(port)
    }

    async fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn rejoin_ticket_wins_and_stops_server() {
        let addr = spawn_activation(FakeActivation::default()).await;
        let mut metadata = MockMetadataApi::new();
        metadata
            .expect_list()
            .returning(|| Ok(vec![instance("cp-0", Role::ControlPlane, &["127.0.0.1"])]));

        let recoverer = NodeRecoverer::new(
            Arc::new(StubRecoveryServer),
            rejoin(metadata, addr.port()),
        );
        let keys = tokio::time::timeout(
            Duration::from_secs(10),
            recoverer.recover(listener().await, "disk-uuid", CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(keys.state_disk_key.as_slice(), b"diskKey");
    }

    #[tokio::test]
    async fn pushed_keys_win_and_stop_rejoin() {
        let issuer: Arc<dyn Issuer> = Arc::new(FakeIssuer::new(Variant::Dummy));
        let server = RecoveryServer::new(AttestedServerConfig::new(Some(issuer), vec![]).unwrap());
        let recoverer = NodeRecoverer::new(Arc::new(server), rejoin(unreachable_peers(), 1));

        let listener = listener().await;
        let addr = listener.local_addr().unwrap();
        let recovering = tokio::spawn(async move {
            recoverer
                .recover(listener, "disk-uuid", CancellationToken::new())
                .await
        });

        let pushed = RecoveredKeys {
            state_disk_key: Zeroizing::new(b"pushedKey".to_vec()),
            measurement_secret: Zeroizing::new(b"secret".to_vec()),
        };
        let channel = Dialer::default().dial_no_verify(&addr.to_string()).unwrap();
        assert_eq!(push_keys(channel, &pushed).await.unwrap(), "disk-uuid");

        let keys = tokio::time::timeout(Duration::from_secs(10), recovering)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(keys.state_disk_key.as_slice(), b"pushedKey");
    }

    #[tokio::test]
    async fn cancellation_stops_both() {
        let mut server = MockKeyRecoverer::new();
        server.expect_serve().times(1).returning(|_, _, _| Err(RecoveryError::Cancelled));
        let recoverer = NodeRecoverer::new(Arc::new(server), rejoin(unreachable_peers(), 1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = recoverer.recover(listener().await, "disk-uuid", cancel).await;
        assert!(matches!(result, Err(RecoveryError::Cancelled)));
    }
}
