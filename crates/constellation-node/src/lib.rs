//! Services running on every Constellation node
//!
//! - [`joinclient`] activates a fresh node against the join service and hands
//!   the returned credentials to kubeadm.
//! - [`recovery`] and [`rejoin`] obtain the state-disk key after a reboot,
//!   either pushed by an operator or fetched from a control-plane peer;
//!   [`recoverer`] races the two.
//! - [`status`] reports the node's lifecycle state.
//!
//! Hardware and cloud access sits behind the traits in [`metadata`],
//! [`disk`] and [`joiner`].

#![deny(missing_docs)]

pub mod disk;
pub mod error;
pub mod joinclient;
pub mod joiner;
pub mod metadata;
pub mod nodestate;
pub mod recoverer;
pub mod recovery;
pub mod rejoin;
pub mod status;

#[cfg(test)]
mod test_support;

use std::time::Duration;

pub use error::{JoinClientError, RecoveryError};
pub use joinclient::JoinClient;
pub use recoverer::NodeRecoverer;
pub use recovery::{RecoveredKeys, RecoveryServer};
pub use rejoin::RejoinClient;
pub use status::{NodeStatusService, StatusReporter};

/// Interval between join and rejoin attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for one join or rejoin attempt
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
