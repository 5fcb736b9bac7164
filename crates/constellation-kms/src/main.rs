//! Constellation KMS binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use constellation_atls::{fake, AttestedServerConfig, Variant};
use constellation_common::{KMS_ATLS_PORT, KMS_PORT};
use constellation_kms::{HkdfBackend, KmsServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Derives data keys from the cluster master secret
#[derive(Parser, Debug)]
#[command(name = "kms", version, about, long_about = None)]
struct Cli {
    /// Port of the in-cluster plain gRPC listener
    #[arg(long, env = "KMS_PORT", default_value_t = KMS_PORT)]
    port: u16,

    /// Port of the attested gRPC listener
    #[arg(long, env = "KMS_ATLS_PORT", default_value_t = KMS_ATLS_PORT)]
    atls_port: u16,

    /// File holding the raw master secret
    #[arg(long, env = "KMS_MASTER_SECRET", default_value = "/constellation/master-secret/key")]
    master_secret: PathBuf,

    /// File holding the raw HKDF salt
    #[arg(long, env = "KMS_SALT", default_value = "/constellation/master-secret/salt")]
    salt: PathBuf,

    /// Attestation variant presented on the attested listener
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

    let master_secret = tokio::fs::read(&cli.master_secret)
        .await
        .with_context(|| format!("reading master secret {}", cli.master_secret.display()))?;
    let salt = tokio::fs::read(&cli.salt)
        .await
        .with_context(|| format!("reading salt {}", cli.salt.display()))?;
    let backend = HkdfBackend::new(master_secret, salt)?;

    let issuer = fake::issuer_for(cli.attestation_variant)?;
    let atls = AttestedServerConfig::new(Some(issuer), Vec::new())?;
    let server = KmsServer::new(Arc::new(backend), atls);

    let plain = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    let attested = TcpListener::bind(("0.0.0.0", cli.atls_port)).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    server.serve(plain, attested, shutdown).await?;
    Ok(())
}
