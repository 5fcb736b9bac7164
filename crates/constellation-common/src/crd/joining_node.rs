//! JoiningNode CRD: carries the components reference of a node until it joins

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Ephemeral record created by the join service for each activation.
///
/// The joining-node reconciler copies `componentsReference` onto the
/// Kubernetes node once it appears and then deletes this resource.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "update.edgeless.systems",
    version = "v1alpha1",
    kind = "JoiningNode",
    plural = "joiningnodes",
    status = "JoiningNodeStatus"
)]
pub struct JoiningNodeSpec {
    /// Kubernetes node name the joiner will register as
    #[serde(default)]
    pub name: String,
    /// Components reference the node joined with
    #[serde(rename = "componentsreference", default)]
    pub components_reference: String,
    /// Whether the joiner is a control-plane node
    #[serde(rename = "iscontrolplane", default)]
    pub is_control_plane: bool,
    /// Time after which the record is dropped even if the node never appears
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// JoiningNode status (unused, kept for the status subresource)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct JoiningNodeStatus {}
