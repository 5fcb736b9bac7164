//! Key derivation backends

use async_trait::async_trait;
use hkdf::Hkdf;
#[cfg(test)]
use mockall::automock;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{KmsError, KEY_INFO_PREFIX, MAX_KEY_LENGTH};

/// Derives data encryption keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KmsBackend: Send + Sync {
    /// Key for `key_id`, `length` bytes long
    async fn get_dek(&self, key_id: &str, length: usize) -> Result<Zeroizing<Vec<u8>>, KmsError>;
}

/// Derives keys as `HKDF-SHA256(salt, master secret, "key-" + id)`
pub struct HkdfBackend {
    master_secret: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
}

impl std::fmt::Debug for HkdfBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HkdfBackend").finish_non_exhaustive()
    }
}

impl HkdfBackend {
    /// Backend over `master_secret` and `salt`
    pub fn new(master_secret: Vec<u8>, salt: Vec<u8>) -> Result<Self, KmsError> {
        if master_secret.is_empty() {
            return Err(KmsError::master_secret("master secret is empty"));
        }
        Ok(Self {
            master_secret: Zeroizing::new(master_secret),
            salt,
        })
    }
}

#[async_trait]
impl KmsBackend for HkdfBackend {
    async fn get_dek(&self, key_id: &str, length: usize) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        if length == 0 || length > MAX_KEY_LENGTH {
            return Err(KmsError::invalid_request(format!(
                "key length must be between 1 and {MAX_KEY_LENGTH}, got {length}"
            )));
        }
        let hk = Hkdf::<Sha256>::new(Some(self.salt.as_slice()), &self.master_secret);
        let mut key = Zeroizing::new(vec![0u8; length]);
        hk.expand(format!("{KEY_INFO_PREFIX}{key_id}").as_bytes(), &mut key)
            .map_err(|e| KmsError::derivation(e.to_string()))?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HkdfBackend {
        HkdfBackend::new(b"masterkey".to_vec(), b"somesalt".to_vec()).unwrap()
    }

    #[tokio::test]
    async fn derivation_is_deterministic_per_id() {
        let b = backend();
        let a1 = b.get_dek("disk-uuid", 32).await.unwrap();
        let a2 = b.get_dek("disk-uuid", 32).await.unwrap();
        let other = b.get_dek("other-uuid", 32).await.unwrap();

        assert_eq!(a1.len(), 32);
        assert_eq!(*a1, *a2);
        assert_ne!(*a1, *other);
    }

    #[tokio::test]
    async fn salt_changes_the_key() {
        let salted = HkdfBackend::new(b"masterkey".to_vec(), b"othersalt".to_vec()).unwrap();
        let a = backend().get_dek("id", 32).await.unwrap();
        let b = salted.get_dek("id", 32).await.unwrap();
        assert_ne!(*a, *b);
    }

    #[tokio::test]
    async fn respects_requested_length() {
        let b = backend();
        for len in [1, 16, 64, MAX_KEY_LENGTH] {
            assert_eq!(b.get_dek("id", len).await.unwrap().len(), len);
        }
        assert!(b.get_dek("id", 0).await.is_err());
        assert!(b.get_dek("id", MAX_KEY_LENGTH + 1).await.is_err());
    }

    #[test]
    fn empty_master_secret_is_rejected() {
        assert!(HkdfBackend::new(Vec::new(), b"salt".to_vec()).is_err());
    }
}
