//! Attestation issuer and validator capabilities
//!
//! Hardware backends are plugged in by implementing [`Issuer`] and
//! [`Validator`]. Each implementation reports the OID of its [`Variant`];
//! the OID tags the certificate extension carrying the document, so several
//! variants can coexist in one deployment.
//!
//! Both traits are synchronous because they run inside rustls certificate
//! callbacks.

use std::fmt;
use std::str::FromStr;

use crate::AtlsError;

/// Produces attestation documents
pub trait Issuer: Send + Sync + fmt::Debug {
    /// Variant of the documents this issuer produces
    fn variant(&self) -> Variant;

    /// Attest to `user_data`, binding the document to the peer's `nonce`
    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AtlsError>;
}

/// Verifies attestation documents
pub trait Validator: Send + Sync + fmt::Debug {
    /// Variant of the documents this validator accepts
    fn variant(&self) -> Variant;

    /// Verify `document` against the expected `nonce` and return its user data
    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AtlsError>;
}

/// Attestation variant, identified on the wire by an OID under 1.3.9900
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Placeholder variant for tests
    Dummy,
    /// AWS Nitro TPM
    AwsNitroTpm,
    /// AWS SEV-SNP
    AwsSevSnp,
    /// GCP SEV-ES
    GcpSevEs,
    /// Azure SEV-SNP
    AzureSevSnp,
    /// Azure Trusted Launch
    AzureTrustedLaunch,
    /// QEMU vTPM
    QemuVtpm,
    /// QEMU TDX
    QemuTdx,
}

impl Variant {
    /// Every known variant
    pub const ALL: [Variant; 8] = [
        Self::Dummy,
        Self::AwsNitroTpm,
        Self::AwsSevSnp,
        Self::GcpSevEs,
        Self::AzureSevSnp,
        Self::AzureTrustedLaunch,
        Self::QemuVtpm,
        Self::QemuTdx,
    ];

    /// Object identifier tagging certificate extensions of this variant
    pub fn oid(&self) -> &'static [u64] {
        match self {
            Self::Dummy => &[1, 3, 9900, 1, 1],
            Self::AwsNitroTpm => &[1, 3, 9900, 2, 1],
            Self::AwsSevSnp => &[1, 3, 9900, 2, 2],
            Self::GcpSevEs => &[1, 3, 9900, 3, 1],
            Self::AzureSevSnp => &[1, 3, 9900, 4, 1],
            Self::AzureTrustedLaunch => &[1, 3, 9900, 4, 2],
            Self::QemuVtpm => &[1, 3, 9900, 5, 1],
            Self::QemuTdx => &[1, 3, 9900, 5, 99],
        }
    }

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dummy => "dummy",
            Self::AwsNitroTpm => "aws-nitro-tpm",
            Self::AwsSevSnp => "aws-sev-snp",
            Self::GcpSevEs => "gcp-sev-es",
            Self::AzureSevSnp => "azure-sev-snp",
            Self::AzureTrustedLaunch => "azure-trustedlaunch",
            Self::QemuVtpm => "qemu-vtpm",
            Self::QemuTdx => "qemu-tdx",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = AtlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| AtlsError::validation(s, "unknown attestation variant"))
    }
}

/// Dotted representation of an OID
pub fn format_oid(arcs: &[u64]) -> String {
    arcs.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn oids_are_unique_and_parse_back() {
        let oids: HashSet<_> = Variant::ALL.iter().map(|v| v.oid()).collect();
        assert_eq!(oids.len(), Variant::ALL.len());
        for v in Variant::ALL {
            assert_eq!(v.to_string().parse::<Variant>().unwrap(), v);
        }
        assert!("tpm".parse::<Variant>().is_err());
    }

    #[test]
    fn formats_dotted_oid() {
        assert_eq!(format_oid(Variant::Dummy.oid()), "1.3.9900.1.1");
    }
}
