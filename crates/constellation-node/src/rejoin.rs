//! Fetches the state-disk key of a rebooted node from its control-plane peers

use std::sync::Arc;
use std::time::Duration;

use constellation_common::JOIN_SERVICE_NODE_PORT;
use constellation_grpc::Dialer;
use constellation_proto::activation::api_client::ApiClient;
use constellation_proto::activation::IssueRejoinTicketRequest;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::metadata::{control_plane_endpoints, Instance, MetadataApi};
use crate::recovery::RecoveredKeys;
use crate::{ATTEMPT_TIMEOUT, RETRY_INTERVAL};

/// Requests rejoin tickets until one control-plane node answers
#[derive(Clone)]
pub struct RejoinClient {
    me: Instance,
    dialer: Dialer,
    metadata: Arc<dyn MetadataApi>,
    interval: Duration,
    timeout: Duration,
    join_port: u16,
}

impl RejoinClient {
    /// Client for the node described by `me`
    pub fn new(me: Instance, dialer: Dialer, metadata: Arc<dyn MetadataApi>) -> Self {
        Self {
            me,
            dialer,
            metadata,
            interval: RETRY_INTERVAL,
            timeout: ATTEMPT_TIMEOUT,
            join_port: JOIN_SERVICE_NODE_PORT,
        }
    }

    /// Override retry interval and per-request deadline
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Override the join service port
    pub fn with_join_port(mut self, port: u16) -> Self {
        self.join_port = port;
        self
    }

    /// Ask peers for the keys of `disk_uuid`, once immediately and then every
    /// interval. Returns `None` once `cancel` fires.
    pub async fn run(&self, disk_uuid: &str, cancel: CancellationToken) -> Option<RecoveredKeys> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let attempt = self.request_from_peers(disk_uuid);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                keys = attempt => if let Some(keys) = keys {
                    info!("Received rejoin ticket");
                    return Some(keys);
                },
            }
        }
    }

    async fn request_from_peers(&self, disk_uuid: &str) -> Option<RecoveredKeys> {
        let endpoints = match tokio::time::timeout(self.timeout, self.metadata.list()).await {
            Ok(Ok(instances)) => control_plane_endpoints(&instances, &self.me, self.join_port),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list instances");
                return None;
            }
            Err(_) => {
                warn!("Listing instances timed out");
                return None;
            }
        };
        if endpoints.is_empty() {
            debug!("No control-plane peers to request a rejoin ticket from");
        }

        for endpoint in endpoints {
            match self.request_ticket(&endpoint, disk_uuid).await {
                Ok(keys) => return Some(keys),
                Err(e) => info!(%endpoint, error = %e, "Requesting rejoin ticket failed"),
            }
        }
        None
    }

    async fn request_ticket(
        &self,
        endpoint: &str,
        disk_uuid: &str,
    ) -> Result<RecoveredKeys, tonic::Status> {
        let channel = self
            .dialer
            .dial(endpoint)
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        let mut client = ApiClient::new(channel);
        let request = client.issue_rejoin_ticket(IssueRejoinTicketRequest {
            disk_uuid: disk_uuid.to_string(),
        });
        let ticket = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| tonic::Status::deadline_exceeded("rejoin ticket request timed out"))??
            .into_inner();
        Ok(RecoveredKeys {
            state_disk_key: Zeroizing::new(ticket.state_disk_key),
            measurement_secret: Zeroizing::new(ticket.measurement_secret),
        })
    }
}
