//! rustls verifiers checking embedded attestation documents
//!
//! WebPKI validation is replaced entirely: aTLS certificates are self-signed
//! and trust comes from the attestation, not from a CA.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{debug, warn};

use crate::attestation::Validator;
use crate::cert;

/// Verifies server certificates on the client side against the client nonce
#[derive(Debug)]
pub struct AttestedServerVerifier {
    validators: Vec<Arc<dyn Validator>>,
    client_nonce: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl AttestedServerVerifier {
    /// Verifier expecting attestations bound to `client_nonce`
    pub fn new(
        validators: Vec<Arc<dyn Validator>>,
        client_nonce: Vec<u8>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            validators,
            client_nonce,
            provider,
        }
    }
}

impl ServerCertVerifier for AttestedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        cert::verify_peer(end_entity, &self.validators, &self.client_nonce, now.as_secs())
            .map_err(|e| {
                warn!(error = %e, "Rejecting server certificate");
                e.into_rustls()
            })?;
        debug!(validators = ?cert::validator_oids(&self.validators), "Server attestation verified");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifies client certificates on the server side against the per-connection
/// server nonce, which it also advertises as the only acceptable CA.
#[derive(Debug)]
pub struct AttestedClientVerifier {
    validators: Vec<Arc<dyn Validator>>,
    server_nonce: Vec<u8>,
    root_hints: Vec<DistinguishedName>,
    provider: Arc<CryptoProvider>,
}

impl AttestedClientVerifier {
    /// Verifier for one connection; `nonce_hint` encodes `server_nonce`
    pub fn new(
        validators: Vec<Arc<dyn Validator>>,
        server_nonce: Vec<u8>,
        nonce_hint: DistinguishedName,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            validators,
            server_nonce,
            root_hints: vec![nonce_hint],
            provider,
        }
    }
}

impl ClientCertVerifier for AttestedClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        cert::verify_peer(end_entity, &self.validators, &self.server_nonce, now.as_secs())
            .map_err(|e| {
                warn!(error = %e, "Rejecting client certificate");
                e.into_rustls()
            })?;
        debug!("Client attestation verified");
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
