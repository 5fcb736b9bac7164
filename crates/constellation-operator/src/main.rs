//! Constellation node operator binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use constellation_common::crd::all_crds;
use constellation_common::kube_utils::{create_client, install_crd};
use constellation_common::{CONSTELLATION_CSP_ENV, CONSTELLATION_UID_ENV, KUBE_SYSTEM_NAMESPACE};
use constellation_operator::controller::Context;
use constellation_operator::deploy::initial_resources;
use constellation_operator::discovery::{Executor, ScalingGroupDiscovery};
use constellation_operator::etcd::{KUBEADM_ETCD_PKI, LOCAL_ETCD_ENDPOINT};
use constellation_operator::health::{
    metrics_router, parse_bind_address, probe_router, serve, Metrics, Readiness,
};
use constellation_operator::leader::LeaderElector;
use constellation_operator::runner;
use constellation_operator::{
    CloudProvider, EtcdClient, KubeClient, KubeClientImpl, UnsupportedCloudProvider,
    UpgradeAgentClient, DEFAULT_AZURE_CLOUD_CONFIG, DEFAULT_GCP_CLOUD_CONFIG,
    DISCOVERY_POLL_INTERVAL, FIELD_MANAGER, LEADER_LEASE_NAME, UPGRADE_AGENT_SOCKET,
};

/// Rolls confidential nodes to new images and Kubernetes versions
#[derive(Parser, Debug)]
#[command(name = "operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Cloud provider the cluster runs on
    #[arg(long, env = CONSTELLATION_CSP_ENV, default_value = "")]
    csp: String,

    /// Uid tagging this cluster's cloud resources
    #[arg(long, env = CONSTELLATION_UID_ENV, default_value = "")]
    uid: String,

    /// CSP credentials file; defaults depend on the CSP
    #[arg(long)]
    cloud_config: Option<PathBuf>,

    /// Address of the metrics endpoint
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// Address of the health probe endpoint
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Only run controllers while holding the leader lease
    #[arg(long)]
    leader_elect: bool,

    /// Path to kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    run(cli).await
}

/// Adapter for `csp`, or `None` when node upgrades are unsupported there.
///
/// No CSP SDK adapter is linked into this binary, so every CSP currently
/// falls back to the joining-node-only mode.
fn cloud_provider(csp: &str, cloud_config: Option<PathBuf>) -> Option<Arc<dyn CloudProvider>> {
    let config = cloud_config.unwrap_or_else(|| match csp {
        "azure" => PathBuf::from(DEFAULT_AZURE_CLOUD_CONFIG),
        "gcp" => PathBuf::from(DEFAULT_GCP_CLOUD_CONFIG),
        _ => PathBuf::new(),
    });
    match csp {
        "azure" | "gcp" | "aws" => {
            warn!(%csp, config = %config.display(), "No cloud provider adapter available");
            None
        }
        _ => {
            info!(%csp, "CSP does not support node upgrades");
            None
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    for crd in all_crds() {
        install_crd(&client, &crd, FIELD_MANAGER).await?;
    }

    let mut leader = if cli.leader_elect {
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| KUBE_SYSTEM_NAMESPACE.to_string());
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("constellation-operator-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &namespace,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let readiness = Readiness::default();
    let metrics = Arc::new(Metrics::default());
    let probe_addr = parse_bind_address(&cli.health_probe_bind_address)?;
    let metrics_addr = parse_bind_address(&cli.metrics_bind_address)?;
    let probes = tokio::spawn(serve(probe_addr, probe_router(readiness.clone())));
    let metrics_server = tokio::spawn(serve(metrics_addr, metrics_router(metrics.clone())));

    let kube: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(client.clone()));
    let csp = cloud_provider(&cli.csp, cli.cloud_config.clone());

    let controllers = match csp {
        Some(csp) => {
            full_controllers(client.clone(), kube, csp, &cli.uid, metrics.clone()).await?
        }
        None => {
            let ctx = Arc::new(Context::new(
                kube,
                Arc::new(UnsupportedCloudProvider),
                Arc::new(EtcdClient::from_kubeadm_pki(KUBEADM_ETCD_PKI, LOCAL_ETCD_ENDPOINT).await?),
                Arc::new(UpgradeAgentClient::new(UPGRADE_AGENT_SOCKET)),
            ));
            info!("Starting controllers:");
            runner::build_joining_node_controllers(client.clone(), ctx, metrics.clone())
        }
    };

    readiness.set_ready();
    info!("Operator ready");

    let leadership_lost = async {
        match leader.as_mut() {
            Some(guard) => guard.lost().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = join_all(controllers) => info!("Controllers stopped"),
        _ = leadership_lost => anyhow::bail!("leadership lost"),
        result = probes => warn!(?result, "Health probe server exited"),
        result = metrics_server => warn!(?result, "Metrics server exited"),
    }
    Ok(())
}

async fn full_controllers(
    client: Client,
    kube: Arc<dyn KubeClient>,
    csp: Arc<dyn CloudProvider>,
    uid: &str,
    metrics: Arc<Metrics>,
) -> anyhow::Result<Vec<std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>>> {
    initial_resources(kube.as_ref(), csp.as_ref(), uid).await?;

    let etcd = EtcdClient::from_kubeadm_pki(KUBEADM_ETCD_PKI, LOCAL_ETCD_ENDPOINT).await?;
    let ctx = Arc::new(Context::new(
        kube.clone(),
        csp.clone(),
        Arc::new(etcd),
        Arc::new(UpgradeAgentClient::new(UPGRADE_AGENT_SOCKET)),
    ));

    info!("Starting controllers:");
    let mut controllers = Vec::new();
    controllers.extend(runner::build_node_version_controllers(
        client.clone(),
        ctx.clone(),
        metrics.clone(),
    ));
    controllers.extend(runner::build_scaling_group_controllers(
        client.clone(),
        ctx.clone(),
        metrics.clone(),
    ));
    controllers.extend(runner::build_pending_node_controllers(
        client.clone(),
        ctx.clone(),
        metrics.clone(),
    ));
    controllers.extend(runner::build_autoscaling_controllers(
        client.clone(),
        ctx.clone(),
        metrics.clone(),
    ));
    controllers.extend(runner::build_joining_node_controllers(
        client.clone(),
        ctx,
        metrics,
    ));

    let discovery = ScalingGroupDiscovery::new(uid, csp, kube);
    controllers.extend(runner::build_discovery(
        client,
        Executor::new(Arc::new(discovery), DISCOVERY_POLL_INTERVAL),
    ));
    Ok(controllers)
}
