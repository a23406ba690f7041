use std::time::Instant;

use common::command::CommandError;
use common::roles::SyncStrategy;
use serde::Serialize;
use tracing::{info, warn};

use super::ssh::{describe_failure, looks_like_ssh_connection_failure};
use super::CodeDistributor;
use crate::telemetry;

/// Why a remote sync did not succeed. Timeouts and connection failures are
/// usually transient; remote exits usually are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailureKind {
    Connect,
    Timeout,
    RemoteExit,
    Spawn,
}

impl SyncFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFailureKind::Connect => "connect",
            SyncFailureKind::Timeout => "timeout",
            SyncFailureKind::RemoteExit => "remote_exit",
            SyncFailureKind::Spawn => "spawn",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncFailureKind::Connect | SyncFailureKind::Timeout)
    }
}

/// `(success, message)` for one node, plus a failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub node_id: String,
    pub success: bool,
    pub message: String,
    pub failure: Option<SyncFailureKind>,
}

impl SyncOutcome {
    fn ok(node_id: &str, message: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: true,
            message,
            failure: None,
        }
    }

    fn failed(node_id: &str, kind: SyncFailureKind, message: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: false,
            message,
            failure: Some(kind),
        }
    }
}

impl CodeDistributor {
    /// Remote argument list for the agent's sync subcommand.
    pub fn sync_argv(&self, restart: bool, strategy: SyncStrategy) -> Vec<String> {
        vec![
            self.agent_binary.clone(),
            "sync".to_string(),
            if restart { "--restart" } else { "--no-restart" }.to_string(),
            format!("--strategy={strategy}"),
        ]
    }

    /// Ask the agent on one node to activate its staged package. Never
    /// returns an error: every failure becomes `success == false` with the
    /// raw remote output in `message`.
    pub async fn trigger_node_sync(
        &self,
        node_id: &str,
        ip_address: &str,
        ssh_user: &str,
        ssh_port: u16,
        restart: bool,
        strategy: SyncStrategy,
    ) -> SyncOutcome {
        let target = self.target_for(ip_address, ssh_user, ssh_port);
        let argv = self.sync_argv(restart, strategy);
        let started = Instant::now();

        let outcome = match target.run(&argv, self.sync_timeout).await {
            Ok(output) if output.success() => {
                let raw = output.combined();
                let message = if raw.is_empty() {
                    format!("sync completed on {}", target.destination())
                } else {
                    raw
                };
                SyncOutcome::ok(node_id, message)
            }
            Ok(output) => {
                let kind = if looks_like_ssh_connection_failure(&output) {
                    SyncFailureKind::Connect
                } else {
                    SyncFailureKind::RemoteExit
                };
                let prefix = match kind {
                    SyncFailureKind::Connect => "connection failed",
                    _ => "sync command failed",
                };
                SyncOutcome::failed(
                    node_id,
                    kind,
                    format!("{prefix}: {}", describe_failure(&target, &output)),
                )
            }
            Err(err @ CommandError::TimedOut { .. }) => SyncOutcome::failed(
                node_id,
                SyncFailureKind::Timeout,
                format!(
                    "sync timed out after {:?} on {} (likely transient): {err}",
                    self.sync_timeout,
                    target.destination()
                ),
            ),
            Err(err) => SyncOutcome::failed(
                node_id,
                SyncFailureKind::Spawn,
                format!("failed to start ssh for {}: {err}", target.destination()),
            ),
        };

        let result = outcome.failure.map(|k| k.as_str()).unwrap_or("ok");
        telemetry::record_node_sync(result, started.elapsed());
        if outcome.success {
            info!(node_id, destination = %target.destination(), %strategy, restart, "node sync succeeded");
        } else {
            warn!(node_id, destination = %target.destination(), failure = result, message = %outcome.message, "node sync failed");
        }
        outcome
    }
}
