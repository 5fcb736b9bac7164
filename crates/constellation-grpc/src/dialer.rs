//! Channel factory for attested and plain gRPC connections

use std::path::Path;
use std::sync::Arc;

use constellation_atls::{AttestedClientConfig, Issuer, Validator};
use tonic::transport::{Channel, Endpoint};

use crate::transport::{connect_atls, connect_unix};
use crate::{DialError, HANDSHAKE_TIMEOUT};

/// Creates gRPC channels to `host:port` endpoints.
///
/// Channels connect lazily: the first RPC establishes the connection and
/// failures surface as `Unavailable` statuses. Every attested channel gets a
/// fresh client nonce.
#[derive(Clone, Debug, Default)]
pub struct Dialer {
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
}

impl Dialer {
    /// Dialer attesting with `issuer` and verifying peers with `validators`
    pub fn new(issuer: Option<Arc<dyn Issuer>>, validators: Vec<Arc<dyn Validator>>) -> Self {
        Self { issuer, validators }
    }

    /// Attested channel that verifies the server
    pub fn dial(&self, target: &str) -> Result<Channel, DialError> {
        let config = AttestedClientConfig::new(self.issuer.clone(), self.validators.clone())?;
        Self::dial_with(target, config)
    }

    /// aTLS channel that neither verifies the server nor attests itself
    pub fn dial_no_verify(&self, target: &str) -> Result<Channel, DialError> {
        let config = AttestedClientConfig::new(None, Vec::new())?;
        Self::dial_with(target, config)
    }

    /// Plaintext channel
    pub fn dial_insecure(&self, target: &str) -> Result<Channel, DialError> {
        Ok(endpoint(target)?.connect_lazy())
    }

    /// Plaintext channel over a unix domain socket
    pub fn dial_unix(path: impl AsRef<Path>) -> Result<Channel, DialError> {
        let path = path.as_ref().to_path_buf();
        // The authority is never resolved, the connector ignores it.
        let endpoint = endpoint("localhost:0")?;
        Ok(endpoint.connect_with_connector_lazy(tower::service_fn(move |uri| {
            connect_unix(path.clone(), uri)
        })))
    }

    fn dial_with(target: &str, config: AttestedClientConfig) -> Result<Channel, DialError> {
        let endpoint = endpoint(target)?;
        Ok(endpoint.connect_with_connector_lazy(tower::service_fn(move |uri| {
            connect_atls(config.clone(), uri)
        })))
    }
}

/// TLS is layered by our connectors, so tonic always sees plain http.
fn endpoint(target: &str) -> Result<Endpoint, DialError> {
    Endpoint::from_shared(format!("http://{target}"))
        .map(|e| e.connect_timeout(HANDSHAKE_TIMEOUT))
        .map_err(|e| DialError::invalid_endpoint(target, e))
}
