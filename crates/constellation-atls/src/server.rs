//! Server side of aTLS
//!
//! rustls cannot change certificates or client-auth settings per connection
//! from a single `ServerConfig`, so the server reads the ClientHello first
//! with a [`LazyConfigAcceptor`] and builds a dedicated config for each
//! handshake.

use std::sync::Arc;

use rcgen::KeyPair;
use rustls::crypto::CryptoProvider;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::attestation::{Issuer, Validator};
use crate::verifier::AttestedClientVerifier;
use crate::{cert, crypto_provider, nonce, AtlsError, ALPN_H2};

/// Server TLS configuration for aTLS connections.
///
/// - With an issuer, every handshake presents a certificate attesting to the
///   server key over the client's nonce.
/// - With validators, clients must present an attested certificate over a
///   server nonce minted for that handshake (mutual aTLS).
#[derive(Clone, Debug)]
pub struct AttestedServerConfig {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    key: KeyPair,
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
    provider: Arc<CryptoProvider>,
}

impl AttestedServerConfig {
    /// Build a server config with a fresh server key
    pub fn new(
        issuer: Option<Arc<dyn Issuer>>,
        validators: Vec<Arc<dyn Validator>>,
    ) -> Result<Self, AtlsError> {
        Ok(Self {
            inner: Arc::new(Inner {
                key: KeyPair::generate()?,
                issuer,
                validators,
                provider: crypto_provider(),
            }),
        })
    }

    /// Whether clients must present an attested certificate
    pub fn is_mutual(&self) -> bool {
        !self.inner.validators.is_empty()
    }

    /// rustls config for one handshake, given the SNI the client sent
    pub fn config_for_client(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<ServerConfig>, AtlsError> {
        let inner = &self.inner;
        let client_nonce = match inner.issuer {
            Some(_) => nonce::from_server_name(server_name)?,
            None => Vec::new(),
        };
        let attested = cert::mint(&inner.key, inner.issuer.as_deref(), &client_nonce)?;

        let builder = ServerConfig::builder_with_provider(inner.provider.clone())
            .with_safe_default_protocol_versions()?;
        let builder = if self.is_mutual() {
            let server_nonce = nonce::generate();
            let hint = cert::nonce_distinguished_name(&inner.key, &server_nonce)?;
            builder.with_client_cert_verifier(Arc::new(AttestedClientVerifier::new(
                inner.validators.clone(),
                server_nonce,
                hint,
                inner.provider.clone(),
            )))
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder.with_single_cert(
            vec![attested.cert],
            rustls::pki_types::PrivateKeyDer::Pkcs8(attested.key),
        )?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(Arc::new(config))
    }

    /// Run the aTLS handshake over an accepted `stream`
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>, AtlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let config = self.config_for_client(start.client_hello().server_name())?;
        let tls = start.into_stream(config).await?;
        debug!(mutual = self.is_mutual(), "aTLS handshake complete");
        Ok(tls)
    }
}
