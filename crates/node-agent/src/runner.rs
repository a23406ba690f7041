use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::fleet::NodeReport;
use common::roles::{RoleDefinition, RoleState};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    config,
    definitions::load_role_definitions,
    detector::RoleDetector,
    host::{HostInspector, SystemHost},
    telemetry,
};

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Start the dedicated `/metrics` HTTP server.
    pub serve_metrics: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            serve_metrics: true,
        }
    }
}

/// Handle returned by [`start_agent`] to manage shutdown.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!(?join_err, "agent task panicked during shutdown");
                    anyhow::bail!("agent task panicked");
                }
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

pub fn detector_for(cfg: &config::AppConfig, host: Arc<dyn HostInspector>) -> RoleDetector {
    RoleDetector::new(host, &cfg.global_version_file)
        .with_service_timeout(cfg.service_timeout())
        .with_agent_version_file(&cfg.version_file)
}

/// Start the detection loop (and the metrics server) for `cfg`.
pub async fn start_agent(cfg: config::AppConfig, options: AgentOptions) -> anyhow::Result<AgentHandle> {
    let host: Arc<dyn HostInspector> = Arc::new(SystemHost::new(cfg.systemctl.clone()));
    start_agent_with_host(cfg, options, host).await
}

pub async fn start_agent_with_host(
    cfg: config::AppConfig,
    options: AgentOptions,
    host: Arc<dyn HostInspector>,
) -> anyhow::Result<AgentHandle> {
    info!(
        roles_file = %cfg.roles_file.display(),
        interval_secs = cfg.detect_interval_secs,
        version = env!("CARGO_PKG_VERSION"),
        "node agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics {
        let metrics_handle = telemetry::init_metrics_recorder();
        let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown_fut).await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let detector = Arc::new(detector_for(&cfg, host));
    let detect_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = detection_loop(
            detector,
            cfg.roles_file.clone(),
            cfg.report_file.clone(),
            cfg.detect_interval(),
            detect_shutdown,
        )
        .await
        {
            error!(?err, "detection loop terminated with error");
        }
    }));

    Ok(AgentHandle { shutdown_tx, tasks })
}

/// Periodic detection. Definitions are re-read every pass so edits apply
/// without a restart; a broken file keeps the last good set.
pub async fn detection_loop(
    detector: Arc<RoleDetector>,
    roles_file: PathBuf,
    report_file: Option<PathBuf>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut definitions: Vec<RoleDefinition> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                match load_role_definitions(&roles_file) {
                    Ok(defs) => definitions = defs,
                    Err(err) => warn!(error = %err, "keeping previous role definitions"),
                }
                let report = detector.build_report(&definitions).await;
                let active = report
                    .roles
                    .values()
                    .filter(|s| s.status == RoleState::Active)
                    .count();
                info!(roles = report.roles.len(), active, "detection pass complete");
                if let Some(path) = &report_file {
                    if let Err(err) = write_report(path, &report) {
                        warn!(path = %path.display(), error = %err, "failed to write report");
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn write_report(path: &Path, report: &NodeReport) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{base_config, MockHost};

    async fn wait_for(path: &Path) {
        for _ in 0..200 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[tokio::test]
    async fn loop_writes_report_and_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let roles_file = dir.path().join("roles.yml");
        std::fs::write(&roles_file, "- name: batch\n").expect("write");
        let report_file = dir.path().join("out").join("report.json");

        let detector = Arc::new(RoleDetector::new(Arc::new(MockHost::new()), dir.path().join("g.json")));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(detection_loop(
            detector,
            roles_file,
            Some(report_file.clone()),
            Duration::from_millis(20),
            rx,
        ));

        wait_for(&report_file).await;
        tx.send(true).expect("send");
        handle.await.expect("join").expect("loop");

        let report: NodeReport =
            serde_json::from_slice(&std::fs::read(&report_file).expect("report")).expect("json");
        assert_eq!(report.roles["batch"].status, RoleState::Active);
    }

    #[tokio::test]
    async fn broken_definitions_keep_previous_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let roles_file = dir.path().join("roles.yml");
        std::fs::write(&roles_file, "- name: batch\n").expect("write");
        let report_file = dir.path().join("report.json");

        let host = Arc::new(MockHost::new());
        let detector = Arc::new(RoleDetector::new(host.clone(), dir.path().join("g.json")));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(detection_loop(
            detector,
            roles_file.clone(),
            Some(report_file.clone()),
            Duration::from_millis(20),
            rx,
        ));

        wait_for(&report_file).await;
        let tmp = dir.path().join("roles.tmp");
        std::fs::write(&tmp, "roles: [").expect("corrupt");
        std::fs::rename(&tmp, &roles_file).expect("swap");
        std::fs::remove_file(&report_file).expect("remove");
        wait_for(&report_file).await;
        tx.send(true).expect("send");
        handle.await.expect("join").expect("loop");

        let report: NodeReport =
            serde_json::from_slice(&std::fs::read(&report_file).expect("report")).expect("json");
        assert!(report.roles.contains_key("batch"));
        assert!(host.port_snapshots() >= 2);
    }

    #[tokio::test]
    async fn handle_shuts_down_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = base_config(dir.path());
        std::fs::write(&cfg.roles_file, "[]").expect("write");
        cfg.report_file = Some(dir.path().join("report.json"));
        let report_file = dir.path().join("report.json");

        let handle = start_agent_with_host(
            cfg,
            AgentOptions { serve_metrics: false },
            Arc::new(MockHost::new()),
        )
        .await
        .expect("start");
        wait_for(&report_file).await;
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown in time")
            .expect("clean shutdown");
    }
}
