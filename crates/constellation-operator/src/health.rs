//! Health probes and reconcile metrics

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::info;

use constellation_common::{Error, Result};

/// Outcome counters of one controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    /// Successful reconciles
    pub success: u64,
    /// Failed reconciles
    pub failure: u64,
}

/// Reconcile counters per controller
#[derive(Debug, Default)]
pub struct Metrics {
    reconciles: DashMap<&'static str, ReconcileCounts>,
}

impl Metrics {
    /// Count one reconcile of `controller`
    pub fn record(&self, controller: &'static str, success: bool) {
        let mut counts = self.reconciles.entry(controller).or_default();
        if success {
            counts.success += 1;
        } else {
            counts.failure += 1;
        }
    }

    /// Counters of `controller`
    pub fn counts(&self, controller: &str) -> ReconcileCounts {
        self.reconciles
            .get(controller)
            .map(|c| *c)
            .unwrap_or_default()
    }

    /// Prometheus text exposition of all counters
    pub fn render(&self) -> String {
        let mut rows: Vec<_> = self
            .reconciles
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        rows.sort_by_key(|(name, _)| *name);

        let mut out = String::from(
            "# HELP controller_runtime_reconcile_total Total number of reconciliations per controller\n\
             # TYPE controller_runtime_reconcile_total counter\n",
        );
        for (controller, counts) in rows {
            let _ = writeln!(
                out,
                "controller_runtime_reconcile_total{{controller=\"{controller}\",result=\"success\"}} {}",
                counts.success
            );
            let _ = writeln!(
                out,
                "controller_runtime_reconcile_total{{controller=\"{controller}\",result=\"error\"}} {}",
                counts.failure
            );
        }
        out
    }
}

/// Readiness flag flipped once the controllers run
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Mark the operator ready
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the operator is ready
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// `/healthz` always answers, `/readyz` only once ready
pub fn probe_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// `/metrics` in Prometheus text format
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(|State(m): State<Arc<Metrics>>| async move { m.render() }))
        .with_state(metrics)
}

/// Parse a bind address. A leading `:` binds all interfaces.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr> {
    let full = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    full.parse()
        .map_err(|_| Error::validation(format!("invalid bind address {address:?}")))
}

/// Serve `router` on `address` until the process exits
pub async fn serve(address: SocketAddr, router: Router) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(%address, "Serving HTTP endpoints");
    axum::serve(listener, router).await?;
    Ok(())
}
