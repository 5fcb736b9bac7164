//! Constellation key management service
//!
//! Data keys are never stored: each key is derived on request from the
//! cluster master secret and the key ID, so the same ID always yields the
//! same key.

#![deny(missing_docs)]

pub mod backend;
pub mod client;
pub mod error;
pub mod server;

pub use backend::{HkdfBackend, KmsBackend};
pub use client::KmsClient;
pub use error::KmsError;
pub use server::KmsServer;

/// Prefix of the HKDF info string; the key ID is appended
pub const KEY_INFO_PREFIX: &str = "key-";

/// Upper bound on requested key lengths (HKDF-SHA256 output limit)
pub const MAX_KEY_LENGTH: usize = 255 * 32;
