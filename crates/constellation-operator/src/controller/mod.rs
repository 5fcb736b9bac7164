//! Reconcilers of the operator's custom resources

pub mod autoscaling_strategy;
pub mod groups;
pub mod joining_node;
pub mod node_version;
pub mod pending_node;
pub mod retire;
pub mod scaling_group;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::error;

use constellation_common::Error;

use crate::client::KubeClient;
use crate::csp::CloudProvider;
use crate::etcd::EtcdRemover;
use crate::upgrade::UpgradeAgent;

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Collaborators shared by all reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes API
    pub kube: Arc<dyn KubeClient>,
    /// Cloud provider adapter
    pub csp: Arc<dyn CloudProvider>,
    /// Removes control-plane nodes from etcd
    pub etcd: Arc<dyn EtcdRemover>,
    /// Runs cluster-wide Kubernetes upgrades on the control plane
    pub upgrade: Arc<dyn UpgradeAgent>,
}

impl Context {
    /// Bundle the collaborators
    pub fn new(
        kube: Arc<dyn KubeClient>,
        csp: Arc<dyn CloudProvider>,
        etcd: Arc<dyn EtcdRemover>,
        upgrade: Arc<dyn UpgradeAgent>,
    ) -> Self {
        Self {
            kube,
            csp,
            etcd,
            upgrade,
        }
    }
}

/// Shared error policy: log and retry shortly
pub fn error_policy<K: ResourceExt>(obj: Arc<K>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(name = %obj.name_any(), error = %err, retryable = err.is_retryable(), "Reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}
