//! aTLS errors

use thiserror::Error;

/// Errors raised while minting or verifying attested certificates
#[derive(Debug, Error)]
pub enum AtlsError {
    /// The issuer could not produce an attestation document
    #[error("issuing attestation: {message}")]
    Issue {
        /// Description of the failure
        message: String,
    },

    /// A validator rejected the embedded attestation document
    #[error("attestation rejected by {variant}: {message}")]
    Validation {
        /// Variant that rejected the document
        variant: String,
        /// Description of the failure
        message: String,
    },

    /// The certificate has no extension matching any configured validator
    #[error("certificate does not contain compatible attestation documents: got extension OIDs {oids:?}")]
    NoCompatibleAttestation {
        /// OIDs of all extensions found on the certificate
        oids: Vec<String>,
    },

    /// The attested user data is not the hash of the certificate's public key
    #[error("certificate hash does not match user data")]
    UserDataMismatch,

    /// The peer certificate could not be parsed or is not self-signed
    #[error("invalid certificate: {message}")]
    Certificate {
        /// Description of the failure
        message: String,
    },

    /// A nonce could not be decoded from the handshake
    #[error("decoding nonce: {message}")]
    Nonce {
        /// Description of the failure
        message: String,
    },

    /// Certificate generation failed
    #[error("generating certificate: {source}")]
    CertGen {
        /// The underlying rcgen error
        #[from]
        source: rcgen::Error,
    },

    /// TLS configuration or handshake failure
    #[error("tls: {source}")]
    Tls {
        /// The underlying rustls error
        #[from]
        source: rustls::Error,
    },

    /// Transport failure during the handshake
    #[error("io: {source}")]
    Io {
        /// The underlying IO error
        #[from]
        source: std::io::Error,
    },
}

impl AtlsError {
    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create a nonce decoding error
    pub fn nonce(msg: impl Into<String>) -> Self {
        Self::Nonce {
            message: msg.into(),
        }
    }

    /// Create a validation error for the named variant
    pub fn validation(variant: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            variant: variant.into(),
            message: msg.into(),
        }
    }

    /// Create an issuing error
    pub fn issue(msg: impl Into<String>) -> Self {
        Self::Issue {
            message: msg.into(),
        }
    }

    /// Convert into a rustls error so that verifiers abort the handshake
    pub fn into_rustls(self) -> rustls::Error {
        match self {
            Self::Tls { source } => source,
            other => rustls::Error::InvalidCertificate(rustls::CertificateError::Other(
                rustls::OtherError(std::sync::Arc::new(other)),
            )),
        }
    }
}
