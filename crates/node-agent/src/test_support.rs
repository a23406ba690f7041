use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::command::CommandError;

use crate::config;
use crate::host::{HostError, HostInspector};

pub(crate) fn base_config(root: &Path) -> config::AppConfig {
    config::AppConfig {
        roles_file: root.join("roles.yml"),
        detect_interval_secs: 1,
        service_timeout_secs: 1,
        global_version_file: root.join("global-version.json"),
        version_file: root.join("state").join("agent-version.json"),
        install_dir: root.join("install"),
        staging_dir: root.join("staging"),
        agent_unit: "rolefleet-agent.service".into(),
        systemctl: "systemctl".into(),
        command_timeout_secs: 5,
        report_file: None,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
    }
}

/// Scripted host: a fixed port set and a fixed set of active units.
#[derive(Default)]
pub(crate) struct MockHost {
    ports: BTreeSet<u16>,
    active: HashSet<String>,
    fail_ports: bool,
    fail_services: bool,
    port_calls: AtomicUsize,
    service_calls: AtomicUsize,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_ports<I: IntoIterator<Item = u16>>(mut self, ports: I) -> Self {
        self.ports.extend(ports);
        self
    }

    pub(crate) fn with_active<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active.extend(units.into_iter().map(Into::into));
        self
    }

    pub(crate) fn failing_ports(mut self) -> Self {
        self.fail_ports = true;
        self
    }

    pub(crate) fn failing_services(mut self) -> Self {
        self.fail_services = true;
        self
    }

    pub(crate) fn port_snapshots(&self) -> usize {
        self.port_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn service_queries(&self) -> usize {
        self.service_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostInspector for MockHost {
    async fn listening_ports(&self) -> Result<BTreeSet<u16>, HostError> {
        self.port_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ports {
            return Err(HostError::CommandFailed {
                command: "ss -H -ltn".into(),
                output: "ss: not found".into(),
            });
        }
        Ok(self.ports.clone())
    }

    async fn service_active(&self, unit: &str, timeout: Duration) -> Result<bool, HostError> {
        self.service_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_services {
            return Err(HostError::Command(CommandError::TimedOut {
                command: format!("systemctl is-active --quiet -- {unit}"),
                timeout,
            }));
        }
        Ok(self.active.contains(unit))
    }
}
