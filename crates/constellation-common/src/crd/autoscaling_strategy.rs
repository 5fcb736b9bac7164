//! AutoscalingStrategy CRD: controls the cluster-autoscaler deployment

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether and how the external cluster-autoscaler runs
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "update.edgeless.systems",
    version = "v1alpha1",
    kind = "AutoscalingStrategy",
    plural = "autoscalingstrategies",
    status = "AutoscalingStrategyStatus",
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".status.enabled"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingStrategySpec {
    /// Desired state of the autoscaler
    #[serde(default)]
    pub enabled: bool,
    /// Name of the autoscaler Deployment
    #[serde(default)]
    pub deployment_name: String,
    /// Namespace of the autoscaler Deployment
    #[serde(default)]
    pub deployment_namespace: String,
    /// Additional `--key=value` flags for the autoscaler
    #[serde(default)]
    pub autoscaler_extra_args: BTreeMap<String, String>,
}

/// Observed state of the autoscaler Deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingStrategyStatus {
    /// Whether the Deployment currently runs a replica
    #[serde(default)]
    pub enabled: bool,
    /// Replica count of the Deployment
    #[serde(default)]
    pub replicas: i32,
}

impl AutoscalingStrategySpec {
    /// Replica count the Deployment should have
    pub fn expected_replicas(&self) -> i32 {
        if self.enabled {
            1
        } else {
            0
        }
    }
}
