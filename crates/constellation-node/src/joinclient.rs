//! Activation of a fresh node against the join service
//!
//! The client runs as a background task until the node has joined:
//!
//! 1. read the UUID of the encrypted state disk (once, no retry)
//! 2. ask the metadata service for this instance's name and role
//! 3. call the join service on every control-plane peer until one hands out
//!    credentials
//! 4. under the node lock: rekey the state disk, persist the node identity
//!    and the kubelet credentials, then run kubeadm join
//!
//! Errors in step 4 are final, everything before it is retried on the next
//! tick.

use std::sync::Arc;
use std::time::Duration;

use constellation_common::file::{FileHandler, WriteMode};
use constellation_common::kubeadm::BootstrapDiscovery;
use constellation_common::role::Role;
use constellation_common::JOIN_SERVICE_NODE_PORT;
use constellation_grpc::Dialer;
use constellation_proto::activation::api_client::ApiClient;
use constellation_proto::activation::{
    ActivateControlPlaneNodeRequest, ActivateControlPlaneNodeResponse, ActivateWorkerNodeRequest,
    ActivateWorkerNodeResponse,
};
use constellation_proto::nodestatus::NodeState;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::disk::{with_open_disk, EncryptedDisk};
use crate::joiner::ClusterJoiner;
use crate::metadata::{control_plane_endpoints, Instance, MetadataApi};
use crate::nodestate::NodeStateFile;
use crate::status::StatusReporter;
use crate::{JoinClientError, ATTEMPT_TIMEOUT, RETRY_INTERVAL};

/// Kubelet client certificate, relative to the state disk mount
pub const KUBELET_CERT_FILE: &str = "kubelet/pki/kubelet-client-crt.pem";

/// Kubelet client key, relative to the state disk mount
pub const KUBELET_KEY_FILE: &str = "kubelet/pki/kubelet-client-key.pem";

/// Held by whoever initializes the node. Once taken it is never released, so
/// a node is either bootstrapped as the first control plane or joins, not
/// both.
pub type NodeLock = Arc<tokio::sync::Mutex<()>>;

/// Timing and addressing of join attempts
#[derive(Clone, Debug)]
pub struct JoinSettings {
    /// Time between two rounds over all peers
    pub interval: Duration,
    /// Deadline for a single metadata call or activation RPC. The kubeadm
    /// join that follows a successful activation is not bounded by it.
    pub timeout: Duration,
    /// Port of the join service on control-plane nodes
    pub join_port: u16,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            interval: RETRY_INTERVAL,
            timeout: ATTEMPT_TIMEOUT,
            join_port: JOIN_SERVICE_NODE_PORT,
        }
    }
}

/// What the join client works with
pub struct JoinDeps {
    /// Shared with the cluster initialization path
    pub node_lock: NodeLock,
    /// Attests this node to the join service
    pub dialer: Dialer,
    /// Cloud metadata
    pub metadata: Arc<dyn MetadataApi>,
    /// Encrypted state disk
    pub disk: Arc<dyn EncryptedDisk>,
    /// Runs kubeadm join
    pub joiner: Arc<dyn ClusterJoiner>,
    /// Rooted at the state disk mount point
    pub files: FileHandler,
    /// Progress reporting
    pub status: StatusReporter,
}

/// Credentials from either activation RPC
struct Ticket {
    state_disk_key: Zeroizing<Vec<u8>>,
    owner_id: Vec<u8>,
    cluster_id: Vec<u8>,
    kubelet_key: Zeroizing<Vec<u8>>,
    kubelet_cert: Vec<u8>,
    discovery: BootstrapDiscovery,
    certificate_key: Option<String>,
}

impl From<ActivateWorkerNodeResponse> for Ticket {
    fn from(r: ActivateWorkerNodeResponse) -> Self {
        Self {
            state_disk_key: Zeroizing::new(r.state_disk_key),
            owner_id: r.owner_id,
            cluster_id: r.cluster_id,
            kubelet_key: Zeroizing::new(r.kubelet_key),
            kubelet_cert: r.kubelet_cert,
            discovery: BootstrapDiscovery {
                api_server_endpoint: r.api_server_endpoint,
                token: r.token,
                ca_cert_hashes: vec![r.discovery_token_ca_cert_hash],
            },
            certificate_key: None,
        }
    }
}

impl From<ActivateControlPlaneNodeResponse> for Ticket {
    fn from(r: ActivateControlPlaneNodeResponse) -> Self {
        Self {
            state_disk_key: Zeroizing::new(r.state_disk_key),
            owner_id: r.owner_id,
            cluster_id: r.cluster_id,
            kubelet_key: Zeroizing::new(r.kubelet_key),
            kubelet_cert: r.kubelet_cert,
            discovery: BootstrapDiscovery {
                api_server_endpoint: r.api_server_endpoint,
                token: r.token,
                ca_cert_hashes: vec![r.discovery_token_ca_cert_hash],
            },
            certificate_key: Some(r.certificate_key),
        }
    }
}

impl JoinClientError {
    /// Failures after credentials were received cannot be retried
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitializing | Self::Disk { .. } | Self::Persist(_) | Self::Join { .. }
        )
    }
}

struct Running {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background task joining this node to the cluster
pub struct JoinClient {
    inner: Arc<Inner>,
    task: tokio::sync::Mutex<Option<Running>>,
}

struct Inner {
    deps: JoinDeps,
    settings: JoinSettings,
    held: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl JoinClient {
    /// Client with default timing
    pub fn new(deps: JoinDeps) -> Self {
        Self::with_settings(deps, JoinSettings::default())
    }

    /// Client with custom timing
    pub fn with_settings(deps: JoinDeps, settings: JoinSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                held: parking_lot::Mutex::new(None),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the join task. Does nothing if it was already started and not
    /// stopped since, even if the task has finished in the meantime.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        info!("Starting join client");
        let stop = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(stop.clone()));
        *task = Some(Running { stop, handle });
    }

    /// Stop the join task and wait for it to exit
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return;
        };

        info!("Stopping join client");
        running.stop.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Join task did not exit cleanly");
        }
        info!("Join client stopped");
    }
}

impl Inner {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        let status = &self.deps.status;
        let disk_uuid = match with_open_disk(self.deps.disk.as_ref(), |d| d.uuid()) {
            Ok(uuid) => uuid,
            Err(e) => {
                error!(error = %e, "Failed to get disk UUID");
                status.set(NodeState::Failed);
                return;
            }
        };
        status.set(NodeState::WaitingForClusterJoin);

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let me = loop {
            match self.node_metadata().await {
                Ok(me) => {
                    info!(name = %me.name, role = %me.role, "Received own instance metadata");
                    break me;
                }
                Err(e) => info!(error = %e, "Failed to retrieve instance metadata"),
            }
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
        };

        loop {
            match self.try_join_at_available_services(&me, &disk_uuid).await {
                Ok(()) => {
                    info!("Node activated and joined the cluster");
                    status.set(NodeState::IsNode);
                    return;
                }
                Err(e) if e.is_unrecoverable() => {
                    error!(error = %e, "Unrecoverable error while joining");
                    status.set(NodeState::Failed);
                    return;
                }
                Err(e) => info!(error = %e, "Activation failed for all available endpoints"),
            }
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
        }
    }

    async fn node_metadata(&self) -> Result<Instance, JoinClientError> {
        let me = tokio::time::timeout(self.settings.timeout, self.deps.metadata.self_instance())
            .await
            .map_err(|_| JoinClientError::Timeout)?
            .map_err(JoinClientError::metadata)?;
        if me.name.is_empty() {
            return Err(JoinClientError::metadata(
                "got instance metadata with empty name",
            ));
        }
        if me.role == Role::Unknown {
            return Err(JoinClientError::metadata(
                "got instance metadata with unknown role",
            ));
        }
        Ok(me)
    }

    async fn try_join_at_available_services(
        &self,
        me: &Instance,
        disk_uuid: &str,
    ) -> Result<(), JoinClientError> {
        let instances = tokio::time::timeout(self.settings.timeout, self.deps.metadata.list())
            .await
            .map_err(|_| JoinClientError::Timeout)?
            .map_err(JoinClientError::metadata)?;
        let endpoints = control_plane_endpoints(&instances, me, self.settings.join_port);
        info!(?endpoints, "Received control-plane endpoints");

        let mut last = JoinClientError::metadata("no control plane IPs found");
        for endpoint in endpoints {
            match self.join(&endpoint, me, disk_uuid).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unrecoverable() => return Err(e),
                Err(e) => {
                    info!(%endpoint, error = %e, "Join service unavailable");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// One attempt against `endpoint`. Only the activation RPC runs under
    /// `settings.timeout`.
    ///
    /// The join step is left unbounded. By the time it starts the node lock
    /// is held for good and the disk carries the new passphrase, so a
    /// deadline there could only abort a half-done join that no later
    /// attempt may resume. `kubeadm join` also routinely runs for minutes,
    /// far beyond the RPC deadline.
    async fn join(&self, endpoint: &str, me: &Instance, disk_uuid: &str) -> Result<(), JoinClientError> {
        let ticket = tokio::time::timeout(
            self.settings.timeout,
            self.request_ticket(endpoint, me, disk_uuid),
        )
        .await
        .map_err(|_| JoinClientError::Timeout)??;
        self.start_node_and_join(ticket, me.role).await
    }

    async fn request_ticket(
        &self,
        endpoint: &str,
        me: &Instance,
        disk_uuid: &str,
    ) -> Result<Ticket, JoinClientError> {
        let mut client = ApiClient::new(self.deps.dialer.dial(endpoint)?);
        let ticket = match me.role {
            Role::Worker => client
                .activate_worker_node(ActivateWorkerNodeRequest {
                    disk_uuid: disk_uuid.to_string(),
                    node_name: me.name.clone(),
                })
                .await?
                .into_inner()
                .into(),
            Role::ControlPlane => client
                .activate_control_plane_node(ActivateControlPlaneNodeRequest {
                    disk_uuid: disk_uuid.to_string(),
                    node_name: me.name.clone(),
                })
                .await?
                .into_inner()
                .into(),
            role => return Err(JoinClientError::UnsupportedRole { role }),
        };
        Ok(ticket)
    }

    async fn start_node_and_join(&self, ticket: Ticket, role: Role) -> Result<(), JoinClientError> {
        let guard = self
            .deps
            .node_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| JoinClientError::AlreadyInitializing)?;
        *self.held.lock() = Some(guard);

        with_open_disk(self.deps.disk.as_ref(), |d| {
            d.update_passphrase(&ticket.state_disk_key)
        })
        .map_err(JoinClientError::disk)?;

        let files = &self.deps.files;
        files.write(KUBELET_CERT_FILE, &ticket.kubelet_cert, WriteMode::Overwrite)?;
        files.write(KUBELET_KEY_FILE, &ticket.kubelet_key, WriteMode::Overwrite)?;
        NodeStateFile {
            role,
            owner_id: ticket.owner_id,
            cluster_id: ticket.cluster_id,
        }
        .to_file(files)?;

        self.deps
            .joiner
            .join_cluster(&ticket.discovery, ticket.certificate_key, role)
            .await
            .map_err(JoinClientError::join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MockEncryptedDisk;
    use crate::joiner::MockClusterJoiner;
    use crate::metadata::MockMetadataApi;
    use crate::test_support::{instance, node_dialer, spawn_activation, FakeActivation};
    use async_trait::async_trait;
    use constellation_common::Error;
    use tokio::sync::mpsc;

    /// Joiner that takes `delay` like a real kubeadm run
    struct SlowJoiner {
        delay: Duration,
        calls: Arc<parking_lot::Mutex<u32>>,
    }

    #[async_trait]
    impl ClusterJoiner for SlowJoiner {
        async fn join_cluster(
            &self,
            _discovery: &BootstrapDiscovery,
            _certificate_key: Option<String>,
            _role: Role,
        ) -> constellation_common::Result<()> {
            *self.calls.lock() += 1;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn settings(join_port: u16) -> JoinSettings {
        JoinSettings {
            interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            join_port,
        }
    }

    fn open_close(disk: &mut MockEncryptedDisk) {
        disk.expect_open().returning(|| Ok(()));
        disk.expect_close().returning(|| Ok(()));
    }

    fn peers(me_role: Role) -> MockMetadataApi {
        let mut metadata = MockMetadataApi::new();
        metadata
            .expect_self_instance()
            .returning(move || Ok(instance("node-1", me_role, &["10.0.0.5"])));
        metadata.expect_list().returning(move || {
            Ok(vec![
                instance("node-1", me_role, &["10.0.0.5"]),
                instance("cp-0", Role::ControlPlane, &["127.0.0.1"]),
            ])
        });
        metadata
    }

    fn deps(
        metadata: MockMetadataApi,
        disk: MockEncryptedDisk,
        joiner: MockClusterJoiner,
        files: FileHandler,
    ) -> JoinDeps {
        JoinDeps {
            node_lock: NodeLock::default(),
            dialer: node_dialer(),
            metadata: Arc::new(metadata),
            disk: Arc::new(disk),
            joiner: Arc::new(joiner),
            files,
            status: StatusReporter::default(),
        }
    }

    async fn wait_for_state(status: &StatusReporter, state: NodeState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while status.get() != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// A worker discovers a control-plane peer, gets activated over aTLS,
    /// rekeys its disk, persists its identity and runs kubeadm join.
    #[tokio::test]
    async fn story_worker_joins_through_control_plane_peer() {
        let fake = FakeActivation::default();
        let addr = spawn_activation(fake.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let files = FileHandler::new(dir.path());

        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid().times(1).returning(|| Ok("disk-uuid".to_string()));
        disk.expect_update_passphrase()
            .withf(|p: &[u8]| p == b"diskKey")
            .times(1)
            .returning(|_| Ok(()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut joiner = MockClusterJoiner::new();
        joiner.expect_join_cluster().times(1).returning(move |d, key, role| {
            let _ = tx.send((d.clone(), key, role));
            Ok(())
        });

        let deps = deps(peers(Role::Worker), disk, joiner, files.clone());
        let status = deps.status.clone();
        let client = JoinClient::with_settings(deps, settings(addr.port()));

        client.start().await;
        let (discovery, key, role) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_state(&status, NodeState::IsNode).await;
        client.stop().await;

        assert_eq!(discovery.api_server_endpoint, "192.0.2.3:6443");
        assert_eq!(discovery.token, "abcdef.0123456789abcdef");
        assert_eq!(discovery.ca_cert_hashes, vec!["sha256:00ff".to_string()]);
        assert_eq!(key, None);
        assert_eq!(role, Role::Worker);

        assert_eq!(
            fake.activations.lock().clone(),
            vec![("disk-uuid".to_string(), "node-1".to_string())]
        );
        let state = NodeStateFile::from_file(&files).unwrap();
        assert_eq!(state.role, Role::Worker);
        assert_eq!(state.owner_id, b"ownerID");
        assert_eq!(state.cluster_id, b"clusterID");
        assert_eq!(
            std::fs::read(dir.path().join(KUBELET_CERT_FILE)).unwrap(),
            b"kubeletCert"
        );
    }

    /// kubeadm takes far longer than the activation deadline. The node still
    /// finishes joining on its first try instead of being cut off.
    #[tokio::test]
    async fn story_slow_kubeadm_join_outlives_rpc_deadline() {
        let addr = spawn_activation(FakeActivation::default()).await;
        let dir = tempfile::tempdir().unwrap();

        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid().returning(|| Ok("disk-uuid".to_string()));
        disk.expect_update_passphrase().times(1).returning(|_| Ok(()));

        let calls = Arc::new(parking_lot::Mutex::new(0));
        let mut deps = deps(
            peers(Role::Worker),
            disk,
            MockClusterJoiner::new(),
            FileHandler::new(dir.path()),
        );
        deps.joiner = Arc::new(SlowJoiner {
            delay: Duration::from_millis(1500),
            calls: calls.clone(),
        });
        let status = deps.status.clone();
        let settings = JoinSettings {
            timeout: Duration::from_millis(500),
            ..settings(addr.port())
        };
        let client = JoinClient::with_settings(deps, settings);

        client.start().await;
        wait_for_state(&status, NodeState::IsNode).await;
        client.stop().await;
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn control_plane_passes_certificate_key_to_joiner() {
        let addr = spawn_activation(FakeActivation::default()).await;
        let dir = tempfile::tempdir().unwrap();

        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid().returning(|| Ok("disk-uuid".to_string()));
        disk.expect_update_passphrase().returning(|_| Ok(()));

        let mut joiner = MockClusterJoiner::new();
        joiner
            .expect_join_cluster()
            .withf(|_, key, role| key.as_deref() == Some("cafe") && *role == Role::ControlPlane)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let deps = deps(
            peers(Role::ControlPlane),
            disk,
            joiner,
            FileHandler::new(dir.path()),
        );
        let status = deps.status.clone();
        let client = JoinClient::with_settings(deps, settings(addr.port()));

        client.start().await;
        wait_for_state(&status, NodeState::IsNode).await;
        client.stop().await;
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    #[tokio::test]
    async fn disk_uuid_failure_ends_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid()
            .times(1)
            .returning(|| Err(Error::internal("no LUKS header")));
        let mut metadata = MockMetadataApi::new();
        metadata.expect_self_instance().never();

        let deps = deps(metadata, disk, MockClusterJoiner::new(), FileHandler::new(dir.path()));
        let status = deps.status.clone();
        let client = JoinClient::with_settings(deps, settings(1));

        client.start().await;
        wait_for_state(&status, NodeState::Failed).await;
        client.stop().await;
    }

    #[tokio::test]
    async fn locked_node_does_not_join() {
        let addr = spawn_activation(FakeActivation::default()).await;
        let dir = tempfile::tempdir().unwrap();

        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid().returning(|| Ok("disk-uuid".to_string()));
        disk.expect_update_passphrase().never();
        let mut joiner = MockClusterJoiner::new();
        joiner.expect_join_cluster().never();

        let deps = deps(peers(Role::Worker), disk, joiner, FileHandler::new(dir.path()));
        let _initializing = deps.node_lock.clone().try_lock_owned().unwrap();
        let status = deps.status.clone();
        let client = JoinClient::with_settings(deps, settings(addr.port()));

        client.start().await;
        wait_for_state(&status, NodeState::Failed).await;
        client.stop().await;
        assert!(!dir.path().join(crate::nodestate::NODE_STATE_FILE).exists());
    }

    #[tokio::test]
    async fn rejected_activation_is_retried() {
        let fake = FakeActivation::failing(tonic::Status::internal("kms down"));
        let addr = spawn_activation(fake).await;
        let dir = tempfile::tempdir().unwrap();

        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid().returning(|| Ok("disk-uuid".to_string()));
        disk.expect_update_passphrase().never();

        let mut metadata = MockMetadataApi::new();
        metadata
            .expect_self_instance()
            .returning(|| Ok(instance("node-1", Role::Worker, &["10.0.0.5"])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        metadata.expect_list().returning(move || {
            let _ = tx.send(());
            Ok(vec![instance("cp-0", Role::ControlPlane, &["127.0.0.1"])])
        });

        let deps = deps(metadata, disk, MockClusterJoiner::new(), FileHandler::new(dir.path()));
        let status = deps.status.clone();
        let client = JoinClient::with_settings(deps, settings(addr.port()));

        client.start().await;
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        client.stop().await;
        assert_eq!(status.get(), NodeState::WaitingForClusterJoin);
    }

    // =========================================================================
    // Start / Stop
    // =========================================================================

    #[tokio::test]
    async fn concurrent_starts_spawn_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = MockEncryptedDisk::new();
        open_close(&mut disk);
        disk.expect_uuid()
            .times(1)
            .returning(|| Ok("disk-uuid".to_string()));
        let mut metadata = MockMetadataApi::new();
        metadata
            .expect_self_instance()
            .returning(|| Err(Error::cloud_provider("metadata server down")));

        let deps = deps(metadata, disk, MockClusterJoiner::new(), FileHandler::new(dir.path()));
        let client = JoinClient::with_settings(deps, settings(1));

        tokio::join!(client.start(), client.start(), client.start(), client.start());
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::join!(client.stop(), client.stop(), client.stop());

        // Stopping a stopped client is a no-op.
        client.stop().await;
        assert!(client.task.lock().await.is_none());
    }
}
