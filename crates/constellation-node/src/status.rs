//! Node lifecycle state, as polled by the status waiter

use std::sync::Arc;

use constellation_proto::nodestatus::node_status_server::{NodeStatus, NodeStatusServer};
use constellation_proto::nodestatus::{GetStateRequest, GetStateResponse, NodeState};
use parking_lot::RwLock;
use tonic::{Request, Response, Status};
use tracing::debug;

/// Shared handle through which node services publish their progress
#[derive(Clone, Debug, Default)]
pub struct StatusReporter {
    state: Arc<RwLock<NodeState>>,
}

impl StatusReporter {
    /// Reporter starting in `state`
    pub fn new(state: NodeState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Current state
    pub fn get(&self) -> NodeState {
        *self.state.read()
    }

    /// Move to `state`
    pub fn set(&self, state: NodeState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "Node state changed");
            *current = state;
        }
    }
}

/// gRPC `NodeStatus` service
#[derive(Clone, Debug)]
pub struct NodeStatusService {
    reporter: StatusReporter,
}

impl NodeStatusService {
    /// Service answering from `reporter`
    pub fn new(reporter: StatusReporter) -> Self {
        Self { reporter }
    }

    /// Wrap into a tonic service
    pub fn into_service(self) -> NodeStatusServer<Self> {
        NodeStatusServer::new(self)
    }
}

#[tonic::async_trait]
impl NodeStatus for NodeStatusService {
    async fn get_state(
        &self,
        _request: Request<GetStateRequest>,
    ) -> Result<Response<GetStateResponse>, Status> {
        Ok(Response::new(GetStateResponse {
            state: self.reporter.get().into(),
        }))
    }
}
