//! Minting and inspecting attested certificates

use std::sync::Arc;

use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, DnValue, KeyPair, PublicKeyData,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::attestation::{format_oid, Issuer, Validator};
use crate::{nonce, AtlsError, CERT_COMMON_NAME};

/// Validity slack on both sides of "now" for minted certificates
const VALIDITY_SLACK: ::time::Duration = ::time::Duration::hours(2);

/// SHA-256 over a DER encoded SubjectPublicKeyInfo
pub fn hash_public_key(spki_der: &[u8]) -> Vec<u8> {
    Sha256::digest(spki_der).to_vec()
}

/// A key pair with its certificate, ready to hand to rustls
#[derive(Debug)]
pub struct AttestedCert {
    /// DER encoded certificate
    pub cert: CertificateDer<'static>,
    /// PKCS#8 DER encoded private key
    pub key: PrivatePkcs8KeyDer<'static>,
}

impl AttestedCert {
    /// Convert into a rustls certified key using `provider` for signing
    pub fn into_certified_key(
        self,
        provider: &CryptoProvider,
    ) -> Result<Arc<CertifiedKey>, AtlsError> {
        let signer = provider
            .key_provider
            .load_private_key(PrivateKeyDer::Pkcs8(self.key))?;
        Ok(Arc::new(CertifiedKey::new(vec![self.cert], signer)))
    }
}

/// Self-sign a certificate for `key`, embedding an attestation over
/// `(hash(pubkey), nonce)` when an issuer is given.
pub fn mint(
    key: &KeyPair,
    issuer: Option<&dyn Issuer>,
    nonce: &[u8],
) -> Result<AttestedCert, AtlsError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(CERT_COMMON_NAME.to_string()),
    );
    params.distinguished_name = dn;
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now - VALIDITY_SLACK;
    params.not_after = now + VALIDITY_SLACK;

    if let Some(issuer) = issuer {
        let user_data = hash_public_key(&key.subject_public_key_info());
        let document = issuer.issue(&user_data, nonce)?;
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(
                issuer.variant().oid(),
                document,
            ));
    }

    let cert = params.self_signed(key)?;
    Ok(AttestedCert {
        cert: cert.der().clone(),
        key: PrivatePkcs8KeyDer::from(key.serialize_der()),
    })
}

/// Distinguished name whose common name carries `nonce`, as sent in the
/// acceptable-CA list of a CertificateRequest.
pub fn nonce_distinguished_name(
    key: &KeyPair,
    server_nonce: &[u8],
) -> Result<rustls::DistinguishedName, AtlsError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(nonce::to_common_name(server_nonce)),
    );
    params.distinguished_name = dn;
    let cert = params.self_signed(key)?;

    let (_, parsed) = X509Certificate::from_der(cert.der())
        .map_err(|e| AtlsError::certificate(e.to_string()))?;
    Ok(rustls::DistinguishedName::from(
        parsed.subject().as_raw().to_vec(),
    ))
}

/// Extract the nonce from the single acceptable-CA distinguished name
pub fn nonce_from_distinguished_names(subjects: &[&[u8]]) -> Result<Vec<u8>, AtlsError> {
    let [subject] = subjects else {
        return Err(AtlsError::nonce(format!(
            "unexpected acceptable CAs length {}",
            subjects.len()
        )));
    };
    let (_, name) =
        X509Name::from_der(subject).map_err(|e| AtlsError::nonce(e.to_string()))?;
    let cn = name
        .iter_common_name()
        .next()
        .ok_or_else(|| AtlsError::nonce("CN not found"))?
        .as_str()
        .map_err(|e| AtlsError::nonce(format!("unexpected RDN type: {e}")))?;
    nonce::from_common_name(cn)
}

/// Verify a peer certificate: self-signed, currently valid, and carrying an
/// attestation accepted by one of `validators` for `nonce`.
///
/// With no validators only the self-signature is checked.
pub fn verify_peer(
    end_entity: &CertificateDer<'_>,
    validators: &[Arc<dyn Validator>],
    nonce: &[u8],
    now_unix: u64,
) -> Result<(), AtlsError> {
    let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
        .map_err(|e| AtlsError::certificate(format!("parsing certificate: {e}")))?;

    cert.verify_signature(None)
        .map_err(|e| AtlsError::certificate(format!("not self-signed: {e}")))?;
    let now = ASN1Time::from_timestamp(now_unix as i64)
        .map_err(|e| AtlsError::certificate(e.to_string()))?;
    if !cert.validity().is_valid_at(now) {
        return Err(AtlsError::certificate("certificate is expired or not yet valid"));
    }

    if validators.is_empty() {
        return Ok(());
    }

    let hash = hash_public_key(cert.public_key().raw);
    let mut seen = Vec::new();
    for ext in cert.extensions() {
        let matching = validators.iter().find(|v| {
            ext.oid
                .iter()
                .is_some_and(|arcs| arcs.eq(v.variant().oid().iter().copied()))
        });
        let Some(validator) = matching else {
            seen.push(ext.oid.to_id_string());
            continue;
        };

        let user_data = validator.validate(ext.value, nonce)?;
        if user_data != hash {
            return Err(AtlsError::UserDataMismatch);
        }
        return Ok(());
    }

    Err(AtlsError::NoCompatibleAttestation { oids: seen })
}

/// Dotted OIDs of all validators, for logging
pub fn validator_oids(validators: &[Arc<dyn Validator>]) -> Vec<String> {
    validators
        .iter()
        .map(|v| format_oid(v.variant().oid()))
        .collect()
}
