use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// JSON logs go to stderr so command output on stdout stays parseable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init();
}

/// Install the Prometheus recorder once per process and return its handle.
pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new()
                .add_global_label("app_version", env!("CARGO_PKG_VERSION"))
                .build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(%err, "metrics recorder already installed");
            }
            handle
        })
        .clone()
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_manifest_load(result: &str) {
    counter!(
        "rolefleet_manifest_loads_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_package_build(result: &str, duration: Duration) {
    counter!(
        "rolefleet_package_builds_total",
        "result" => result.to_string()
    )
    .increment(1);
    histogram!(
        "rolefleet_package_build_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_node_sync(result: &str, duration: Duration) {
    counter!(
        "rolefleet_node_syncs_total",
        "result" => result.to_string()
    )
    .increment(1);
    histogram!(
        "rolefleet_node_sync_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_report_collection(result: &str) {
    counter!(
        "rolefleet_report_collections_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_reconcile_sweep(nodes: usize, blocked: usize, drifted: usize) {
    counter!("rolefleet_reconcile_sweeps_total").increment(1);
    gauge!("rolefleet_nodes").set(nodes as f64);
    gauge!("rolefleet_nodes_blocked").set(blocked as f64);
    gauge!("rolefleet_nodes_drifted").set(drifted as f64);
}
