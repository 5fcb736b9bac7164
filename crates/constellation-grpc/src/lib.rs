//! gRPC plumbing shared by Constellation services
//!
//! - [`transport`] wires aTLS into tonic on both ends of a connection.
//! - [`Dialer`] hands out channels that verify, skip or omit aTLS.
//! - [`Waiter`] polls node status endpoints until they reach a target state.

#![deny(missing_docs)]

pub mod dialer;
pub mod error;
pub mod transport;
pub mod waiter;

use std::time::Duration;

pub use dialer::Dialer;
pub use error::{DialError, WaitError};
pub use waiter::Waiter;

/// Deadline for a single aTLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker carried by errors of failed aTLS handshakes.
///
/// Retry loops use it to tell attestation failures apart from endpoints that
/// are simply not reachable yet.
pub const HANDSHAKE_FAILED: &str = "authentication handshake failed";
