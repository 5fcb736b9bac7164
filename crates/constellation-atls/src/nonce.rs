//! Nonce generation and handshake encodings

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use rustls::pki_types::ServerName;

use crate::AtlsError;

/// Length in bytes of aTLS nonces
pub const NONCE_LENGTH: usize = 32;

/// Suffix of the synthetic SNI host name carrying the client nonce
pub const SNI_SUFFIX: &str = "atls";

/// Fresh random nonce
pub fn generate() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encode a nonce as a DNS name usable in SNI.
///
/// DNS labels are limited to 63 characters, so the hex string is split into
/// 32-character labels.
pub fn to_server_name(nonce: &[u8]) -> Result<ServerName<'static>, AtlsError> {
    let encoded = hex::encode(nonce);
    let mut labels: Vec<&str> = encoded
        .as_bytes()
        .chunks(32)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();
    labels.push(SNI_SUFFIX);
    ServerName::try_from(labels.join("."))
        .map_err(|e| AtlsError::nonce(format!("encoding SNI: {e}")))
}

/// Decode the client nonce from the SNI host name of a ClientHello
pub fn from_server_name(server_name: Option<&str>) -> Result<Vec<u8>, AtlsError> {
    let name = server_name.ok_or_else(|| AtlsError::nonce("client sent no server name"))?;
    let hex_part = name
        .strip_suffix(SNI_SUFFIX)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(|| AtlsError::nonce(format!("unexpected server name {name:?}")))?;
    hex::decode(hex_part.replace('.', "")).map_err(|e| AtlsError::nonce(e.to_string()))
}

/// Base64 form used in the acceptable-CA common name
pub fn to_common_name(nonce: &[u8]) -> String {
    STANDARD.encode(nonce)
}

/// Decode a nonce from an acceptable-CA common name
pub fn from_common_name(cn: &str) -> Result<Vec<u8>, AtlsError> {
    STANDARD
        .decode(cn)
        .map_err(|e| AtlsError::nonce(format!("decoding common name: {e}")))
}
