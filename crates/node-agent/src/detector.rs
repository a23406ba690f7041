//! Role detection on the local node.
//!
//! Each pass takes one listening-port snapshot and checks every role's path,
//! service and version independently. A failing probe degrades only the field
//! it feeds.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::fleet::NodeReport;
use common::roles::{RoleDefinition, RoleState, RoleStatus};
use tracing::{debug, warn};

use crate::host::{normalize_unit, HostInspector};
use crate::telemetry;
use crate::version::{lookup_role_version, read_agent_version};

pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RoleDetector {
    host: Arc<dyn HostInspector>,
    service_timeout: Duration,
    global_version_file: PathBuf,
    agent_version_file: Option<PathBuf>,
}

impl RoleDetector {
    pub fn new(host: Arc<dyn HostInspector>, global_version_file: impl Into<PathBuf>) -> Self {
        Self {
            host,
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
            global_version_file: global_version_file.into(),
            agent_version_file: None,
        }
    }

    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    pub fn with_agent_version_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_version_file = Some(path.into());
        self
    }

    pub async fn detect_all(&self, definitions: &[RoleDefinition]) -> HashMap<String, RoleStatus> {
        let started = Instant::now();
        let listening = match self.host.listening_ports().await {
            Ok(ports) => Some(ports),
            Err(err) => {
                warn!(error = %err, "listening port snapshot failed");
                telemetry::record_host_probe_failure("ports");
                None
            }
        };

        let mut statuses = HashMap::with_capacity(definitions.len());
        for def in definitions {
            let status = self.detect_role(def, listening.as_ref()).await;
            telemetry::record_role_state(&def.name, status.status);
            statuses.insert(def.name.clone(), status);
        }
        telemetry::record_detection_pass(statuses.len(), started.elapsed());
        statuses
    }

    /// Detect one role against an existing port snapshot. Without a snapshot
    /// no ports are reported.
    pub async fn detect_role(&self, def: &RoleDefinition, listening: Option<&BTreeSet<u16>>) -> RoleStatus {
        let target = def.target_path.trim();
        let (path_exists, path) = if target.is_empty() {
            (true, None)
        } else {
            (Path::new(target).exists(), Some(target.to_string()))
        };

        let service_name = def
            .systemd_service
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(normalize_unit);
        let service_running = match &service_name {
            Some(unit) => match self.host.service_active(unit, self.service_timeout).await {
                Ok(active) => active,
                Err(err) => {
                    warn!(role = %def.name, unit = %unit, error = %err, "service check failed");
                    telemetry::record_host_probe_failure("service");
                    false
                }
            },
            None => false,
        };

        let ports = match (def.health_check_port, listening) {
            (Some(port), Some(snapshot)) if snapshot.contains(&port) => vec![port],
            _ => Vec::new(),
        };

        let version = if path_exists {
            lookup_role_version(target, &self.global_version_file)
        } else {
            None
        };

        let status = RoleState::derive(path_exists, service_name.is_some(), service_running);
        debug!(role = %def.name, status = status.as_str(), "role detected");
        RoleStatus {
            path_exists,
            path,
            service_running,
            service_name,
            ports,
            version,
            status,
        }
    }

    /// Full report for the control plane.
    pub async fn build_report(&self, definitions: &[RoleDefinition]) -> NodeReport {
        let roles = self.detect_all(definitions).await;
        let mut report = NodeReport::new(Utc::now());
        report.services = NodeReport::services_from_roles(definitions, &roles);
        report.roles = roles;
        report.agent_version = self.agent_version_file.as_deref().and_then(|path| {
            read_agent_version(path)
                .map_err(|err| warn!(error = %err, "agent version unavailable"))
                .ok()
                .flatten()
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockHost;

    fn def(name: &str, path: &str, service: Option<&str>, port: Option<u16>) -> RoleDefinition {
        RoleDefinition {
            name: name.into(),
            target_path: path.into(),
            systemd_service: service.map(str::to_string),
            health_check_port: port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn status_truth_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = dir.path().join("present");
        std::fs::create_dir_all(&present).expect("mkdir");
        let present = present.display().to_string();
        let absent = dir.path().join("absent").display().to_string();

        let host = Arc::new(MockHost::new().with_ports([8080]).with_active(["up.service"]));
        let detector = RoleDetector::new(host.clone(), dir.path().join("global.json"));
        let defs = vec![
            def("missing", &absent, Some("up"), None),
            def("stopped", &present, Some("down"), None),
            def("running", &present, Some("up"), Some(8080)),
            def("no-service", &present, None, Some(9090)),
            def("service-only", "", Some("up"), None),
            def("service-only-down", "", Some("down"), None),
        ];

        let statuses = detector.detect_all(&defs).await;
        let state = |name: &str| statuses[name].status;
        assert_eq!(state("missing"), RoleState::NotInstalled);
        assert_eq!(state("stopped"), RoleState::Inactive);
        assert_eq!(state("running"), RoleState::Active);
        assert_eq!(state("no-service"), RoleState::Active);
        assert_eq!(state("service-only"), RoleState::Active);
        assert_eq!(state("service-only-down"), RoleState::Inactive);

        assert_eq!(statuses["running"].ports, vec![8080]);
        assert!(statuses["no-service"].ports.is_empty());
        assert_eq!(statuses["service-only"].path, None);
        assert!(statuses["service-only"].path_exists);
        assert_eq!(statuses["stopped"].service_name.as_deref(), Some("down.service"));
        assert_eq!(host.port_snapshots(), 1);
        assert_eq!(host.service_queries(), 5);
    }

    #[tokio::test]
    async fn probe_failures_degrade_single_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(MockHost::new().failing_ports().failing_services());
        let detector = RoleDetector::new(host, dir.path().join("global.json"));
        let status = detector
            .detect_role(&def("web", &dir.path().display().to_string(), Some("nginx"), Some(80)), None)
            .await;
        assert!(status.path_exists);
        assert!(!status.service_running);
        assert!(status.ports.is_empty());
        assert_eq!(status.status, RoleState::Inactive);
    }

    #[tokio::test]
    async fn report_includes_services_and_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let web = dir.path().join("web");
        std::fs::create_dir_all(&web).expect("mkdir");
        std::fs::write(web.join("version.json"), r#"{"commit":"abc1234"}"#).expect("write");
        let agent_version = dir.path().join("agent-version.json");
        std::fs::write(
            &agent_version,
            r#"{"commit":"def5678","built_at":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("write");

        let host = Arc::new(MockHost::new().with_ports([80]).with_active(["nginx.service"]));
        let detector = RoleDetector::new(host, dir.path().join("global.json"))
            .with_agent_version_file(&agent_version);
        let report = detector
            .build_report(&[def("web", &web.display().to_string(), Some("nginx"), Some(80))])
            .await;

        assert_eq!(report.roles["web"].version.as_deref(), Some("abc1234"));
        assert_eq!(report.services.len(), 1);
        assert!(report.services[0].healthy);
        assert_eq!(report.agent_version.map(|v| v.commit).as_deref(), Some("def5678"));
    }

    #[tokio::test]
    async fn stopped_service_is_reported_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(MockHost::new());
        let detector = RoleDetector::new(host, dir.path().join("global.json"));
        let report = detector
            .build_report(&[def("cache", &dir.path().display().to_string(), Some("redis"), Some(6379))])
            .await;

        assert_eq!(report.roles["cache"].status, RoleState::Inactive);
        assert_eq!(report.services.len(), 1);
        let cache = &report.services[0];
        assert_eq!((cache.name.as_str(), cache.port), ("cache", 6379));
        assert!(!cache.healthy);
    }

    #[tokio::test]
    async fn active_role_without_listening_port_is_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(MockHost::new().with_active(["nginx.service"]));
        let detector = RoleDetector::new(host, dir.path().join("global.json"));
        let web = RoleDefinition {
            protocol: Some("udp".into()),
            endpoint_path: Some("/health".into()),
            ..def("web", &dir.path().display().to_string(), Some("nginx"), Some(53))
        };
        let report = detector
            .build_report(&[web, def("gone", &dir.path().join("nope").display().to_string(), None, Some(1))])
            .await;

        assert_eq!(report.roles["web"].status, RoleState::Active);
        assert_eq!(report.services.len(), 1);
        assert!(!report.services[0].healthy);
        assert_eq!(report.services[0].protocol, "udp");
        assert_eq!(report.services[0].endpoint_path.as_deref(), Some("/health"));
    }
}
