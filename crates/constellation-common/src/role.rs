//! Node roles

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of a node inside the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Role {
    /// Role could not be determined
    #[default]
    Unknown,
    /// Control-plane member (runs etcd, API server, join service)
    ControlPlane,
    /// Data-plane node
    Worker,
}

impl Role {
    /// Returns true for control-plane nodes
    pub fn is_control_plane(&self) -> bool {
        matches!(self, Self::ControlPlane)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::ControlPlane => write!(f, "ControlPlane"),
            Self::Worker => write!(f, "Worker"),
        }
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "controlplane" => Ok(Self::ControlPlane),
            "worker" => Ok(Self::Worker),
            _ => Err(crate::Error::validation(format!("unknown role: {s}"))),
        }
    }
}
