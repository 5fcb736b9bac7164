//! Scaling group discovery
//!
//! ScalingGroups are not watched objects but CSP state. [`Executor`] polls an
//! [`ExternalReconciler`] on a fixed interval and whenever it is triggered,
//! for example when a node joins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use kube::ResourceExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use constellation_common::crd::{ScalingGroup, ScalingGroupSpec};
use constellation_common::{Result, NODE_VERSION_RESOURCE_NAME};

use crate::client::KubeClient;
use crate::csp::CloudProvider;
use crate::{DEFAULT_SCALING_GROUP_MAX, DEFAULT_SCALING_GROUP_MIN};

const INITIAL_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// A reconciler driven by polling instead of watch events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalReconciler: Send + Sync {
    /// Run one pass. `Some(delay)` asks for the next pass after `delay`
    /// instead of the poll interval.
    async fn reconcile(&self) -> Result<Option<Duration>>;
}

/// Runs an [`ExternalReconciler`] periodically
pub struct Executor {
    reconciler: Arc<dyn ExternalReconciler>,
    poll_interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
}

impl Executor {
    /// Executor running `reconciler` every `poll_interval`
    pub fn new(reconciler: Arc<dyn ExternalReconciler>, poll_interval: Duration) -> Self {
        Self {
            reconciler,
            poll_interval,
            trigger: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Handle that starts the next pass immediately. Triggers arriving
    /// while a pass runs collapse into one follow-up pass.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Token stopping [`Executor::run`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run passes until cancelled. The first pass starts right away.
    pub async fn run(self) {
        let mut next = Duration::ZERO;
        let mut backoff = INITIAL_ERROR_BACKOFF;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Executor stopped");
                    return;
                }
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(next) => {}
            }

            match self.reconciler.reconcile().await {
                Ok(requeue) => {
                    backoff = INITIAL_ERROR_BACKOFF;
                    next = requeue.unwrap_or(self.poll_interval);
                }
                Err(e) => {
                    warn!(error = %e, retry_ms = backoff.as_millis() as u64, "External reconcile failed");
                    next = backoff;
                    backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
                }
            }
        }
    }
}

/// Mirrors the CSP's scaling groups as ScalingGroup resources
pub struct ScalingGroupDiscovery {
    uid: String,
    csp: Arc<dyn CloudProvider>,
    kube: Arc<dyn KubeClient>,
}

impl ScalingGroupDiscovery {
    /// Discovery of the groups tagged with cluster `uid`
    pub fn new(uid: impl Into<String>, csp: Arc<dyn CloudProvider>, kube: Arc<dyn KubeClient>) -> Self {
        Self {
            uid: uid.into(),
            csp,
            kube,
        }
    }
}

#[async_trait]
impl ExternalReconciler for ScalingGroupDiscovery {
    async fn reconcile(&self) -> Result<Option<Duration>> {
        info!("Reconciling external scaling groups");
        let discovered = self.csp.list_scaling_groups(&self.uid).await?;
        let existing = self.kube.list_scaling_groups().await?;

        let mut wanted = Vec::with_capacity(discovered.len());
        for group in &discovered {
            let name = group.name.to_lowercase();
            match existing.iter().find(|sg| sg.name_any() == name) {
                Some(current) if current.spec.node_group_name != group.node_group_name => {
                    info!(scaling_group = %name, node_group = %group.node_group_name, "Patching node group name");
                    self.kube
                        .set_scaling_group_node_group_name(&name, &group.node_group_name)
                        .await?;
                }
                Some(_) => {}
                None => {
                    let resource = ScalingGroup::new(
                        &name,
                        ScalingGroupSpec {
                            node_version: NODE_VERSION_RESOURCE_NAME.to_string(),
                            group_id: group.group_id.clone(),
                            autoscaler_group_name: group.autoscaling_group_name.clone(),
                            node_group_name: group.node_group_name.clone(),
                            autoscaling: false,
                            min: DEFAULT_SCALING_GROUP_MIN,
                            max: DEFAULT_SCALING_GROUP_MAX,
                            role: group.role,
                        },
                    );
                    if self.kube.create_scaling_group(&resource).await? {
                        info!(scaling_group = %name, node_group = %group.node_group_name, "Created scaling group");
                    }
                }
            }
            wanted.push(name);
        }
        info!(count = discovered.len(), "Ensured scaling groups exist");

        for stale in existing.iter().filter(|sg| !wanted.contains(&sg.name_any())) {
            info!(scaling_group = %stale.name_any(), "Deleting scaling group");
            self.kube.delete_scaling_group(&stale.name_any()).await?;
        }
        Ok(None)
    }
}
