//! Fake attestation for tests and local development
//!
//! The fake document is plain JSON `{"UserData": <base64>, "Nonce": <base64>}`
//! and provides no security whatsoever.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::attestation::{Issuer, Validator, Variant};
use crate::AtlsError;

/// Unsigned attestation document
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FakeAttestationDoc {
    /// Attested user data
    #[serde(rename = "UserData", with = "b64")]
    pub user_data: Vec<u8>,
    /// Nonce the document is bound to
    #[serde(rename = "Nonce", with = "b64")]
    pub nonce: Vec<u8>,
}

mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Issues [`FakeAttestationDoc`]s
#[derive(Clone, Debug)]
pub struct FakeIssuer {
    variant: Variant,
    user_data_override: Option<Vec<u8>>,
}

impl FakeIssuer {
    /// Fake issuer reporting `variant`
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            user_data_override: None,
        }
    }

    /// Fake issuer that attests to fixed user data instead of the requested one
    pub fn with_user_data(variant: Variant, user_data: Vec<u8>) -> Self {
        Self {
            variant,
            user_data_override: Some(user_data),
        }
    }
}

impl Issuer for FakeIssuer {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AtlsError> {
        let doc = FakeAttestationDoc {
            user_data: self
                .user_data_override
                .clone()
                .unwrap_or_else(|| user_data.to_vec()),
            nonce: nonce.to_vec(),
        };
        serde_json::to_vec(&doc).map_err(|e| AtlsError::issue(e.to_string()))
    }
}

/// Validates [`FakeAttestationDoc`]s by comparing the nonce
#[derive(Clone, Debug)]
pub struct FakeValidator {
    variant: Variant,
    fail_with: Option<String>,
}

impl FakeValidator {
    /// Fake validator accepting `variant`
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            fail_with: None,
        }
    }

    /// Fake validator that rejects every document
    pub fn failing(variant: Variant, message: impl Into<String>) -> Self {
        Self {
            variant,
            fail_with: Some(message.into()),
        }
    }
}

impl Validator for FakeValidator {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AtlsError> {
        let doc: FakeAttestationDoc = serde_json::from_slice(document)
            .map_err(|e| AtlsError::validation(self.variant.as_str(), e.to_string()))?;
        if doc.nonce != nonce {
            return Err(AtlsError::validation(
                self.variant.as_str(),
                format!(
                    "invalid nonce: expected {}, got {}",
                    hex::encode(nonce),
                    hex::encode(&doc.nonce)
                ),
            ));
        }
        if let Some(msg) = &self.fail_with {
            return Err(AtlsError::validation(self.variant.as_str(), msg.clone()));
        }
        Ok(doc.user_data)
    }
}

/// Issuer for `variant`. Only [`Variant::Dummy`] is available in this build.
pub fn issuer_for(variant: Variant) -> Result<Arc<dyn Issuer>, AtlsError> {
    match variant {
        Variant::Dummy => Ok(Arc::new(FakeIssuer::new(variant))),
        other => Err(AtlsError::issue(format!("no issuer available for {other}"))),
    }
}

/// Validator for `variant`. Only [`Variant::Dummy`] is available in this build.
pub fn validator_for(variant: Variant) -> Result<Arc<dyn Validator>, AtlsError> {
    match variant {
        Variant::Dummy => Ok(Arc::new(FakeValidator::new(variant))),
        other => Err(AtlsError::validation(
            other.as_str(),
            "no validator available in this build",
        )),
    }
}
