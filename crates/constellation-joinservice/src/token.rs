//! kubeadm bootstrap tokens and discovery data

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;
use x509_parser::pem::parse_x509_pem;

pub use constellation_common::kubeadm::BootstrapDiscovery;
use constellation_common::KUBE_SYSTEM_NAMESPACE;

use crate::certkey::{generate_certificate_key, CertificateKeyUploader};
use crate::{JoinServiceError, Result};

/// Length of the public token ID
pub const TOKEN_ID_LENGTH: usize = 6;
/// Length of the token secret
pub const TOKEN_SECRET_LENGTH: usize = 16;
/// Group bootstrap tokens authenticate as
pub const BOOTSTRAP_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";
/// Secret type of bootstrap tokens
pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";
/// ConfigMap holding the kubeadm cluster configuration
pub const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
/// Key of the cluster configuration inside [`KUBEADM_CONFIG_MAP`]
pub const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Produces join credentials for new nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinTokenGetter: Send + Sync {
    /// Fresh bootstrap token valid for `ttl`
    async fn get_join_token(&self, ttl: Duration) -> Result<BootstrapDiscovery>;

    /// Key under which the control-plane certificates can be downloaded
    async fn get_control_plane_certificate_key(&self) -> Result<String>;
}

/// Random `(id, secret)` pair in the bootstrap token alphabet
pub fn generate_token() -> (String, String) {
    let mut rng = rand::thread_rng();
    let mut pick = |n: usize| -> String {
        (0..n)
            .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
            .collect()
    };
    let id = pick(TOKEN_ID_LENGTH);
    let secret = pick(TOKEN_SECRET_LENGTH);
    (id, secret)
}

/// kubeadm discovery pin of a CA: SHA-256 over its SubjectPublicKeyInfo
pub fn discovery_hash(ca_cert_pem: &[u8]) -> Result<String> {
    let (_, pem) = parse_x509_pem(ca_cert_pem)
        .map_err(|e| JoinServiceError::certificate(format!("decoding CA PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| JoinServiceError::certificate(format!("parsing CA: {e}")))?;
    Ok(format!(
        "sha256:{}",
        hex::encode(Sha256::digest(cert.public_key().raw))
    ))
}

/// Secret registering a bootstrap token with the API server
pub fn bootstrap_token_secret(id: &str, secret: &str, ttl: Duration, now: DateTime<Utc>) -> Secret {
    let expiration = now
        + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(15));
    let data = BTreeMap::from([
        ("token-id".to_string(), id.to_string()),
        ("token-secret".to_string(), secret.to_string()),
        (
            "expiration".to_string(),
            expiration.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("usage-bootstrap-authentication".to_string(), "true".to_string()),
        ("usage-bootstrap-signing".to_string(), "true".to_string()),
        ("auth-extra-groups".to_string(), BOOTSTRAP_GROUP.to_string()),
        (
            "description".to_string(),
            "Bootstrap token for a Constellation node".to_string(),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(format!("bootstrap-token-{id}")),
            namespace: Some(KUBE_SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        type_: Some(BOOTSTRAP_TOKEN_SECRET_TYPE.to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration {
    #[serde(default)]
    control_plane_endpoint: String,
}

/// `controlPlaneEndpoint` of a kubeadm ClusterConfiguration document
pub fn control_plane_endpoint(cluster_configuration: &str) -> Result<String> {
    let config: ClusterConfiguration = serde_yaml::from_str(cluster_configuration)
        .map_err(|e| JoinServiceError::token(format!("parsing ClusterConfiguration: {e}")))?;
    if config.control_plane_endpoint.is_empty() {
        return Err(JoinServiceError::token(
            "ClusterConfiguration has no controlPlaneEndpoint",
        ));
    }
    Ok(config.control_plane_endpoint)
}

/// Issues bootstrap tokens as Secrets in `kube-system`
pub struct KubeTokenIssuer {
    client: Client,
    ca_cert_path: PathBuf,
    uploader: Arc<dyn CertificateKeyUploader>,
}

impl KubeTokenIssuer {
    /// Issuer pinning the CA at `ca_cert_path`
    pub fn new(
        client: Client,
        ca_cert_path: impl Into<PathBuf>,
        uploader: Arc<dyn CertificateKeyUploader>,
    ) -> Self {
        Self {
            client,
            ca_cert_path: ca_cert_path.into(),
            uploader,
        }
    }
}

#[async_trait]
impl JoinTokenGetter for KubeTokenIssuer {
    async fn get_join_token(&self, ttl: Duration) -> Result<BootstrapDiscovery> {
        let ca_pem = tokio::fs::read(&self.ca_cert_path).await?;
        let ca_hash = discovery_hash(&ca_pem)?;

        let config_maps: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let kubeadm_config = config_maps.get(KUBEADM_CONFIG_MAP).await?;
        let cluster_configuration = kubeadm_config
            .data
            .as_ref()
            .and_then(|d| d.get(CLUSTER_CONFIGURATION_KEY))
            .ok_or_else(|| {
                JoinServiceError::token(format!(
                    "{KUBEADM_CONFIG_MAP} has no {CLUSTER_CONFIGURATION_KEY}"
                ))
            })?;
        let api_server_endpoint = control_plane_endpoint(cluster_configuration)?;

        let (id, secret) = generate_token();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        secrets
            .create(
                &PostParams::default(),
                &bootstrap_token_secret(&id, &secret, ttl, Utc::now()),
            )
            .await?;
        info!(token_id = %id, ttl_secs = ttl.as_secs(), "Created bootstrap token");

        Ok(BootstrapDiscovery {
            api_server_endpoint,
            token: format!("{id}.{secret}"),
            ca_cert_hashes: vec![ca_hash],
        })
    }

    async fn get_control_plane_certificate_key(&self) -> Result<String> {
        let key = generate_certificate_key();
        self.uploader.upload(&key).await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair, PublicKeyData};

    #[test]
    fn tokens_match_kubeadm_format() {
        let (id, secret) = generate_token();
        assert_eq!(id.len(), TOKEN_ID_LENGTH);
        assert_eq!(secret.len(), TOKEN_SECRET_LENGTH);
        assert!(format!("{id}{secret}")
            .bytes()
            .all(|b| TOKEN_CHARSET.contains(&b)));
    }

    #[test]
    fn secret_carries_token_and_expiry() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let secret = bootstrap_token_secret("abcdef", "0123456789abcdef", Duration::from_secs(900), now);

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("bootstrap-token-abcdef")
        );
        assert_eq!(secret.type_.as_deref(), Some(BOOTSTRAP_TOKEN_SECRET_TYPE));
        let data = secret.string_data.unwrap();
        assert_eq!(data["token-secret"], "0123456789abcdef");
        assert_eq!(data["expiration"], "2024-01-01T00:15:00Z");
        assert_eq!(data["auth-extra-groups"], BOOTSTRAP_GROUP);
    }

    #[test]
    fn discovery_hash_pins_the_public_key() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::default().self_signed(&key).unwrap();
        let expected = format!("sha256:{}", hex::encode(Sha256::digest(key.subject_public_key_info())));

        assert_eq!(discovery_hash(cert.pem().as_bytes()).unwrap(), expected);
        assert!(discovery_hash(b"garbage").is_err());
    }

    #[test]
    fn reads_control_plane_endpoint() {
        let yaml = "apiVersion: kubeadm.k8s.io/v1beta3\nkind: ClusterConfiguration\ncontrolPlaneEndpoint: 10.9.0.1:6443\n";
        assert_eq!(control_plane_endpoint(yaml).unwrap(), "10.9.0.1:6443");
        assert!(control_plane_endpoint("kind: ClusterConfiguration\n").is_err());
    }
}
