//! Cluster identity persisted next to cluster services

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// File name of the identity document under a service's base path
pub const ID_FILENAME: &str = "id";

/// Owner and cluster IDs, stored as `{"owner": <base64>, "cluster": <base64>}`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterIds {
    /// ID of the party that created the cluster
    #[serde(with = "b64")]
    pub owner: Vec<u8>,
    /// ID of the cluster
    #[serde(with = "b64")]
    pub cluster: Vec<u8>,
}

/// serde adapter storing bytes as standard base64 strings
pub mod b64 {
    use super::*;

    /// Serialize bytes as base64
    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from base64
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
