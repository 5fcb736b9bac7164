//! Constellation join service binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use constellation_atls::{fake, AttestedServerConfig, Variant};
use constellation_common::kube_utils::create_client;
use constellation_common::JOIN_SERVICE_PORT;
use constellation_grpc::transport;
use constellation_joinservice::ca::KubeletCa;
use constellation_joinservice::certkey::KubeadmUploader;
use constellation_joinservice::registry::KubeRegistry;
use constellation_joinservice::token::KubeTokenIssuer;
use constellation_joinservice::{ActivationServer, CA_CERT_PATH, CA_KEY_PATH, DEFAULT_BASE_PATH};
use constellation_kms::KmsClient;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Hands keys and join credentials to attested nodes
#[derive(Parser, Debug)]
#[command(name = "joinservice", version, about, long_about = None)]
struct Cli {
    /// Port to serve the activation API on
    #[arg(long, env = "JOIN_SERVICE_PORT", default_value_t = JOIN_SERVICE_PORT)]
    port: u16,

    /// Plain endpoint of the KMS
    #[arg(long, env = "KMS_ENDPOINT", default_value = "kms.kube-system:9000")]
    kms_endpoint: String,

    /// Directory holding the cluster identity file
    #[arg(long, env = "JOIN_SERVICE_BASE_PATH", default_value = DEFAULT_BASE_PATH)]
    base_path: PathBuf,

    /// Path to kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Cluster CA certificate
    #[arg(long, default_value = CA_CERT_PATH)]
    ca_cert: PathBuf,

    /// Cluster CA key
    #[arg(long, default_value = CA_KEY_PATH)]
    ca_key: PathBuf,

    /// kubeadm binary used to upload control-plane certificates
    #[arg(long, default_value = "kubeadm")]
    kubeadm: PathBuf,

    /// Attestation variant joining nodes must present
    #[arg(long, env = "CONSTEL_ATTESTATION_VARIANT", default_value = "dummy")]
    attestation_variant: Variant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install aws-lc-rs crypto provider");
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let ca = KubeletCa::from_files(&cli.ca_cert, &cli.ca_key)?;
    let tokens = KubeTokenIssuer::new(
        client.clone(),
        &cli.ca_cert,
        Arc::new(KubeadmUploader::new(&cli.kubeadm)),
    );
    let server = ActivationServer::new(
        &cli.base_path,
        Arc::new(KmsClient::new(&cli.kms_endpoint)?),
        Arc::new(tokens),
        Arc::new(ca),
        Arc::new(KubeRegistry::new(client)),
    );

    let validator = fake::validator_for(cli.attestation_variant)?;
    let atls = AttestedServerConfig::new(None, vec![validator])?;
    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!(addr = ?listener.local_addr().ok(), "Starting join service");

    Server::builder()
        .add_service(server.into_service())
        .serve_with_incoming_shutdown(transport::incoming(listener, atls), async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;
    Ok(())
}
