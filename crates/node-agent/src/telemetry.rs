use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use common::roles::RoleState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// JSON logs on stderr; stdout carries `detect --json` output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
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

pub fn record_detection_pass(roles: usize, duration: Duration) {
    counter!("rolefleet_agent_detection_passes_total").increment(1);
    gauge!("rolefleet_agent_roles").set(roles as f64);
    histogram!("rolefleet_agent_detection_duration_ms").record(duration.as_secs_f64() * 1000.0);
}

pub fn record_role_state(role: &str, state: RoleState) {
    for candidate in [RoleState::NotInstalled, RoleState::Inactive, RoleState::Active] {
        gauge!(
            "rolefleet_agent_role_state",
            "role" => role.to_string(),
            "state" => candidate.as_str()
        )
        .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

pub fn record_host_probe_failure(probe: &'static str) {
    counter!(
        "rolefleet_agent_host_probe_failures_total",
        "probe" => probe
    )
    .increment(1);
}

pub fn record_sync_result(result: &str) {
    counter!(
        "rolefleet_agent_syncs_total",
        "result" => result.to_string()
    )
    .increment(1);
}
