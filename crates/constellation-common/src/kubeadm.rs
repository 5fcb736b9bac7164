//! kubeadm join arguments exchanged between the join service and nodes

/// Everything `kubeadm join` needs to discover and trust the API server
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapDiscovery {
    /// `host:port` of the API server
    pub api_server_endpoint: String,
    /// Bootstrap token `<id>.<secret>`
    pub token: String,
    /// Pins of the cluster CA, `sha256:<hex>`
    pub ca_cert_hashes: Vec<String>,
}
