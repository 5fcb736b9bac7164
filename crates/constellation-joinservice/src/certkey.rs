//! Control-plane certificate key upload

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use tokio::process::Command;
use tracing::info;

use crate::{JoinServiceError, Result};

/// Length in bytes of kubeadm certificate keys
pub const CERTIFICATE_KEY_LENGTH: usize = 32;

/// Encrypts and uploads the control-plane certificates under a key
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateKeyUploader: Send + Sync {
    /// Upload the shared control-plane certificates encrypted with `key`
    async fn upload(&self, key: &str) -> Result<()>;
}

/// Fresh hex encoded certificate key
pub fn generate_certificate_key() -> String {
    let mut key = [0u8; CERTIFICATE_KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

/// Uploads certificates with `kubeadm init phase upload-certs`
#[derive(Clone, Debug)]
pub struct KubeadmUploader {
    kubeadm: PathBuf,
}

impl KubeadmUploader {
    /// Uploader invoking the given kubeadm binary
    pub fn new(kubeadm: impl Into<PathBuf>) -> Self {
        Self {
            kubeadm: kubeadm.into(),
        }
    }
}

#[async_trait]
impl CertificateKeyUploader for KubeadmUploader {
    async fn upload(&self, key: &str) -> Result<()> {
        let output = Command::new(&self.kubeadm)
            .args([
                "init",
                "phase",
                "upload-certs",
                "--upload-certs",
                "--certificate-key",
                key,
            ])
            .output()
            .await?;
        if !output.status.success() {
            return Err(JoinServiceError::command(
                "kubeadm init phase upload-certs",
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        info!("Uploaded control-plane certificates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_hex_and_random() {
        let key = generate_certificate_key();
        assert_eq!(key.len(), CERTIFICATE_KEY_LENGTH * 2);
        assert!(hex::decode(&key).is_ok());
        assert_ne!(key, generate_certificate_key());
    }

    #[tokio::test]
    async fn failing_command_is_reported() {
        let err = KubeadmUploader::new("false").upload("00").await.unwrap_err();
        assert!(matches!(err, JoinServiceError::Command { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let err = KubeadmUploader::new("/nonexistent/kubeadm")
            .upload("00")
            .await
            .unwrap_err();
        assert!(matches!(err, JoinServiceError::Io(_)));
    }
}
