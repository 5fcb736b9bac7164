//! Identity of a node, persisted on its encrypted state disk

use constellation_common::file::{FileHandler, WriteMode};
use constellation_common::id::b64;
use constellation_common::role::Role;
use constellation_common::Result;
use serde::{Deserialize, Serialize};

/// Location of the node state file relative to the state disk mount point
pub const NODE_STATE_FILE: &str = "constellation/node_state.json";

/// Mount point of the decrypted state disk
pub const STATE_DISK_MOUNT: &str = "/run/state";

/// Role and cluster membership of this node.
///
/// Written once when the node first joins and never changed afterwards.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeStateFile {
    /// Role the node joined with
    pub role: Role,
    /// ID of the cluster owner
    #[serde(rename = "ownerID", with = "b64")]
    pub owner_id: Vec<u8>,
    /// ID of the cluster
    #[serde(rename = "clusterID", with = "b64")]
    pub cluster_id: Vec<u8>,
}

impl NodeStateFile {
    /// Read the node state from `files`
    pub fn from_file(files: &FileHandler) -> Result<Self> {
        files.read_json(NODE_STATE_FILE)
    }

    /// Persist the node state, refusing to overwrite an existing file
    pub fn to_file(&self, files: &FileHandler) -> Result<()> {
        files.write_json(NODE_STATE_FILE, self, WriteMode::CreateNew)
    }
}
