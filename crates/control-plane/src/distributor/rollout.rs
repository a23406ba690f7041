use common::roles::SyncStrategy;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::package::{verify_package, CodePackage};
use super::sync::SyncFailureKind;
use super::CodeDistributor;
use crate::config::RolloutConfig;
use crate::error::DistributorError;
use crate::policy::NodePolicy;
use crate::store::NodeRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutOptions {
    pub concurrency: usize,
    pub restart: bool,
    pub strategy: SyncStrategy,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            restart: true,
            strategy: SyncStrategy::Graceful,
        }
    }
}

impl From<&RolloutConfig> for RolloutOptions {
    fn from(cfg: &RolloutConfig) -> Self {
        Self {
            concurrency: cfg.concurrency,
            restart: cfg.restart,
            strategy: cfg.strategy,
        }
    }
}

/// A node selected for rollout together with its resolved policy.
#[derive(Debug, Clone)]
pub struct RolloutTarget {
    pub record: NodeRecord,
    pub policy: NodePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRolloutStatus {
    Synced,
    /// Skipped because the node's role set has a hard conflict.
    Blocked,
    StageFailed,
    SyncFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRolloutResult {
    pub node_id: String,
    pub status: NodeRolloutStatus,
    pub message: String,
    pub failure: Option<SyncFailureKind>,
}

impl NodeRolloutResult {
    pub fn is_success(&self) -> bool {
        self.status == NodeRolloutStatus::Synced
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub rollout_id: Uuid,
    pub commit: String,
    /// One entry per target, sorted by node id.
    pub results: Vec<NodeRolloutResult>,
}

impl RolloutReport {
    pub fn succeeded(&self) -> usize {
        self.count(NodeRolloutStatus::Synced)
    }

    pub fn blocked(&self) -> usize {
        self.count(NodeRolloutStatus::Blocked)
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded() - self.blocked()
    }

    fn count(&self, status: NodeRolloutStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

impl CodeDistributor {
    /// Verify `package` once, then stage and activate it on every unblocked
    /// target with at most `options.concurrency` nodes in flight. Only a
    /// failed verification aborts the rollout; node failures land in the
    /// report.
    pub async fn rollout(
        &self,
        package: &CodePackage,
        targets: Vec<RolloutTarget>,
        options: &RolloutOptions,
    ) -> Result<RolloutReport, DistributorError> {
        let rollout_id = Uuid::new_v4();
        let to_verify = package.clone();
        tokio::task::spawn_blocking(move || verify_package(&to_verify))
            .await
            .map_err(|err| DistributorError::Join(err.to_string()))??;

        let (blocked, ready): (Vec<_>, Vec<_>) =
            targets.into_iter().partition(|t| t.policy.is_blocked());

        let mut results: Vec<NodeRolloutResult> = blocked
            .into_iter()
            .map(|target| {
                let pairs: Vec<String> = target
                    .policy
                    .hard_conflicts
                    .iter()
                    .map(|p| p.to_string())
                    .collect();
                warn!(
                    %rollout_id,
                    node_id = %target.record.node_id,
                    conflicts = %pairs.join(", "),
                    "skipping node with hard role conflicts"
                );
                NodeRolloutResult {
                    node_id: target.record.node_id,
                    status: NodeRolloutStatus::Blocked,
                    message: format!("blocked by hard conflicts: {}", pairs.join(", ")),
                    failure: None,
                }
            })
            .collect();

        info!(
            %rollout_id,
            commit = %package.commit_hash,
            nodes = ready.len(),
            blocked = results.len(),
            concurrency = options.concurrency.max(1),
            "starting rollout"
        );

        let mut tasks = futures_util::stream::iter(
            ready
                .into_iter()
                .map(|target| async move { self.rollout_node(package, &target.record, options).await }),
        )
        .buffer_unordered(options.concurrency.max(1));

        while let Some(result) = tasks.next().await {
            results.push(result);
        }
        results.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let report = RolloutReport {
            rollout_id,
            commit: package.commit_hash.clone(),
            results,
        };
        info!(
            %rollout_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            blocked = report.blocked(),
            "rollout finished"
        );
        Ok(report)
    }

    async fn rollout_node(
        &self,
        package: &CodePackage,
        record: &NodeRecord,
        options: &RolloutOptions,
    ) -> NodeRolloutResult {
        let target = self.target_for_node(record);
        if let Err(err) = self.stage_package(&target, package).await {
            warn!(node_id = %record.node_id, destination = %target, error = %err, "staging failed");
            return NodeRolloutResult {
                node_id: record.node_id.clone(),
                status: NodeRolloutStatus::StageFailed,
                failure: Some(classify_stage_error(&err)),
                message: err.to_string(),
            };
        }

        let outcome = self
            .trigger_node_sync(
                &record.node_id,
                &record.host,
                &record.ssh_user,
                record.ssh_port,
                options.restart,
                options.strategy,
            )
            .await;
        NodeRolloutResult {
            node_id: outcome.node_id,
            status: if outcome.success {
                NodeRolloutStatus::Synced
            } else {
                NodeRolloutStatus::SyncFailed
            },
            message: outcome.message,
            failure: outcome.failure,
        }
    }
}

fn classify_stage_error(err: &DistributorError) -> SyncFailureKind {
    match err {
        DistributorError::Command(inner) if inner.is_timeout() => SyncFailureKind::Timeout,
        DistributorError::Command(_) => SyncFailureKind::Spawn,
        DistributorError::Upload { message, .. } if message.starts_with("exit 255") => {
            SyncFailureKind::Connect
        }
        _ => SyncFailureKind::RemoteExit,
    }
}
