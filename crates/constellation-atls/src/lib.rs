//! Attested TLS (aTLS)
//!
//! aTLS reuses a standard TLS handshake to exchange attestation documents.
//! Each side presents a freshly minted self-signed certificate carrying an
//! X.509 extension whose OID identifies the attestation variant and whose
//! value is an attestation document over
//! `(SHA-256(SubjectPublicKeyInfo), peer nonce)`.
//!
//! # Nonce transport
//!
//! TLS has no field for application nonces, so both ride on existing ones:
//!
//! - client → server: the client nonce is hex encoded into the SNI host name
//!   (`<32 hex>.<32 hex>.atls`). The server reads it from the ClientHello
//!   before choosing its certificate.
//! - server → client (mutual aTLS only): the server nonce is base64 encoded
//!   into the common name of the single distinguished name advertised in
//!   `CertificateRequest.certificate_authorities`. The client decodes it when
//!   asked for a certificate.
//!
//! # Freshness
//!
//! A [`client::AttestedClientConfig`] fixes its nonce at construction. The
//! server attestation is therefore only guaranteed fresh for the first
//! connection made with a config. Build a new config per connection when
//! freshness must not rely on the application protocol. Servers mint a new
//! nonce for every accepted handshake.

#![deny(missing_docs)]

pub mod attestation;
pub mod cert;
pub mod client;
pub mod error;
pub mod fake;
pub mod nonce;
pub mod server;
pub mod verifier;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub use attestation::{Issuer, Validator, Variant};
pub use client::AttestedClientConfig;
pub use error::AtlsError;
pub use server::AttestedServerConfig;

/// ALPN protocol negotiated on aTLS connections (gRPC over HTTP/2)
pub const ALPN_H2: &[u8] = b"h2";

/// Common name of aTLS leaf certificates
pub const CERT_COMMON_NAME: &str = "Constellation";

/// Crypto provider used for all aTLS configs
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
