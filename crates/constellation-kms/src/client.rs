//! Client for the KMS data-key API

use constellation_grpc::Dialer;
use constellation_proto::kms::api_client::ApiClient;
use constellation_proto::kms::GetDataKeyRequest;
use tonic::transport::Channel;
use tracing::debug;
use zeroize::Zeroizing;

use crate::KmsError;

/// Requests data keys from the in-cluster KMS over its plain listener
#[derive(Clone, Debug)]
pub struct KmsClient {
    endpoint: String,
    channel: Channel,
}

impl KmsClient {
    /// Client for the KMS at `endpoint` (`host:port`)
    pub fn new(endpoint: impl Into<String>) -> Result<Self, KmsError> {
        let endpoint = endpoint.into();
        let channel = Dialer::default().dial_insecure(&endpoint)?;
        Ok(Self { endpoint, channel })
    }

    /// Derived key for `key_id`, `length` bytes long
    pub async fn get_data_key(
        &self,
        key_id: &str,
        length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let length = u32::try_from(length)
            .map_err(|_| KmsError::invalid_request(format!("key length {length} too large")))?;
        debug!(endpoint = %self.endpoint, key_id, "Requesting data key");

        let resp = ApiClient::new(self.channel.clone())
            .get_data_key(GetDataKeyRequest {
                data_key_id: key_id.to_string(),
                length,
            })
            .await?;
        Ok(Zeroizing::new(resp.into_inner().data_key))
    }
}
