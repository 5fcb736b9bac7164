//! Client side of aTLS

use std::sync::Arc;

use rcgen::KeyPair;
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::attestation::{Issuer, Validator};
use crate::verifier::AttestedServerVerifier;
use crate::{cert, crypto_provider, nonce, AtlsError, ALPN_H2};

/// Answers a server's CertificateRequest with an attested certificate bound
/// to the nonce found in the acceptable-CA list.
#[derive(Debug)]
struct AttestedCertResolver {
    issuer: Arc<dyn Issuer>,
    provider: Arc<CryptoProvider>,
}

impl AttestedCertResolver {
    fn certified_key(&self, root_hint_subjects: &[&[u8]]) -> Result<Arc<CertifiedKey>, AtlsError> {
        let server_nonce = cert::nonce_from_distinguished_names(root_hint_subjects)?;
        let key = KeyPair::generate()?;
        cert::mint(&key, Some(self.issuer.as_ref()), &server_nonce)?
            .into_certified_key(&self.provider)
    }
}

impl ResolvesClientCert for AttestedCertResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match self.certified_key(root_hint_subjects) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "Cannot answer client certificate request");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Client TLS configuration for aTLS connections.
///
/// The client nonce is generated once here and reused for every connection
/// made with this config (see the crate docs on freshness).
///
/// - With validators, the server must present an attestation accepted by one
///   of them.
/// - With an issuer, the client can answer mutual aTLS requests.
#[derive(Clone, Debug)]
pub struct AttestedClientConfig {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl AttestedClientConfig {
    /// Build a client config
    pub fn new(
        issuer: Option<Arc<dyn Issuer>>,
        validators: Vec<Arc<dyn Validator>>,
    ) -> Result<Self, AtlsError> {
        let provider = crypto_provider();
        let client_nonce = nonce::generate();
        let server_name = nonce::to_server_name(&client_nonce)?;

        let verifier = Arc::new(AttestedServerVerifier::new(
            validators,
            client_nonce,
            provider.clone(),
        ));
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut config = match issuer {
            Some(issuer) => builder.with_client_cert_resolver(Arc::new(AttestedCertResolver {
                issuer,
                provider,
            })),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    /// The underlying rustls config
    pub fn rustls_config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    /// SNI host name carrying the client nonce
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Run the aTLS handshake over `stream`
    pub async fn connect<IO>(&self, stream: IO) -> Result<TlsStream<IO>, AtlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = TlsConnector::from(self.config.clone());
        Ok(connector.connect(self.server_name.clone(), stream).await?)
    }
}
