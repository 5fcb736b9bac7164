//! Kubelet serving certificates signed by the cluster CA

use std::path::Path;

#[cfg(test)]
use mockall::automock;
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{JoinServiceError, Result};

/// Validity of kubelet serving certificates
const KUBELET_CERT_VALIDITY_DAYS: i64 = 365;

/// Organization kubelets authenticate as
pub const NODES_ORGANIZATION: &str = "system:nodes";

/// Signed kubelet certificate and its private key, both PEM encoded
#[derive(Debug)]
pub struct KubeletCredentials {
    /// Certificate chain leaf
    pub cert_pem: Vec<u8>,
    /// PKCS#8 private key
    pub key_pem: Zeroizing<Vec<u8>>,
}

/// Issues kubelet certificates
#[cfg_attr(test, automock)]
pub trait CertificateAuthority: Send + Sync {
    /// Certificate and key for the kubelet of `node_name`
    fn get_certificate(&self, node_name: &str) -> Result<KubeletCredentials>;
}

/// CA backed by the cluster's kubeadm CA files
pub struct KubeletCa {
    ca_cert_pem: String,
    ca_key_pem: Zeroizing<String>,
}

impl KubeletCa {
    /// CA from PEM strings
    pub fn new(ca_cert_pem: String, ca_key_pem: String) -> Self {
        Self {
            ca_cert_pem,
            ca_key_pem: Zeroizing::new(ca_key_pem),
        }
    }

    /// CA from the certificate and key files
    pub fn from_files(cert: &Path, key: &Path) -> Result<Self> {
        Ok(Self::new(
            std::fs::read_to_string(cert)?,
            std::fs::read_to_string(key)?,
        ))
    }
}

impl CertificateAuthority for KubeletCa {
    fn get_certificate(&self, node_name: &str) -> Result<KubeletCredentials> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("system:node:{node_name}")),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(NODES_ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - ::time::Duration::minutes(5);
        params.not_after = now + ::time::Duration::days(KUBELET_CERT_VALIDITY_DAYS);

        let san = Ia5String::try_from(node_name.to_string())
            .map_err(|e| JoinServiceError::certificate(format!("invalid node name {node_name:?}: {e}")))?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let kubelet_key = KeyPair::generate().map_err(JoinServiceError::certificate)?;
        let ca_key = KeyPair::from_pem(&self.ca_key_pem).map_err(JoinServiceError::certificate)?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| JoinServiceError::certificate(format!("loading CA: {e}")))?;
        let cert = params
            .signed_by(&kubelet_key, &issuer)
            .map_err(JoinServiceError::certificate)?;

        debug!(node = %node_name, "Signed kubelet certificate");
        Ok(KubeletCredentials {
            cert_pem: cert.pem().into_bytes(),
            key_pem: Zeroizing::new(kubelet_key.serialize_pem().into_bytes()),
        })
    }
}
