//! Polls node status endpoints until they report a target state

use std::error::Error as _;
use std::time::Duration;

use constellation_proto::nodestatus::node_status_client::NodeStatusClient;
use constellation_proto::nodestatus::{GetStateRequest, NodeState};
use tonic::{Code, Status};
use tracing::{debug, info};

use crate::{Dialer, WaitError, HANDSHAKE_FAILED};

/// Default time between two polls of the same endpoint
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Waits for nodes to reach one of a set of states.
///
/// Dropping the returned futures cancels the wait.
#[derive(Clone, Debug)]
pub struct Waiter {
    dialer: Dialer,
    targets: Vec<NodeState>,
    interval: Duration,
}

impl Waiter {
    /// Waiter accepting any state in `targets`
    pub fn new(dialer: Dialer, targets: impl IntoIterator<Item = NodeState>) -> Self {
        Self {
            dialer,
            targets: targets.into_iter().collect(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll `endpoint` until it reports a target state.
    ///
    /// The first poll happens immediately. Unreachable endpoints are retried;
    /// failed attestation and any other error status end the wait.
    pub async fn wait_for(&self, endpoint: &str) -> Result<NodeState, WaitError> {
        let mut client = NodeStatusClient::new(self.dialer.dial(endpoint)?);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            match client.get_state(GetStateRequest {}).await {
                Ok(resp) => {
                    let state = resp.into_inner().state();
                    if self.targets.contains(&state) {
                        info!(endpoint, state = ?state, "Node reached target state");
                        return Ok(state);
                    }
                    debug!(endpoint, state = ?state, "Node not in target state yet");
                }
                Err(status) if is_retryable(&status) => {
                    debug!(endpoint, error = %status, "Node not reachable yet");
                }
                Err(status) => {
                    return Err(WaitError::Status {
                        endpoint: endpoint.to_string(),
                        status,
                    })
                }
            }
        }
    }

    /// Wait for each endpoint in turn
    pub async fn wait_for_all(&self, endpoints: &[String]) -> Result<(), WaitError> {
        for endpoint in endpoints {
            self.wait_for(endpoint).await?;
        }
        Ok(())
    }
}

/// Unavailable statuses are retried unless the attestation itself failed.
pub fn is_retryable(status: &Status) -> bool {
    status.code() == Code::Unavailable && !is_handshake_failure(status)
}

fn is_handshake_failure(status: &Status) -> bool {
    if status.message().contains(HANDSHAKE_FAILED) {
        return true;
    }
    let mut source = status.source();
    while let Some(err) = source {
        if err.to_string().contains(HANDSHAKE_FAILED) {
            return true;
        }
        source = err.source();
    }
    false
}
