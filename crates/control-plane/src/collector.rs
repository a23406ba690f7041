//! Pulls node reports from agents over SSH.
//!
//! The agent prints its report with `detect --json`; the control plane stores
//! the latest one per node for reconciliation and discovery.

use std::time::Duration;

use common::fleet::NodeReport;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::distributor::CodeDistributor;
use crate::error::{CollectError, StoreError};
use crate::store::{FleetStore, NodeRecord};
use crate::telemetry;

#[derive(Debug, Default, Clone, Serialize)]
pub struct CollectSummary {
    pub collected: Vec<String>,
    /// `(node_id, error)` for nodes whose report could not be refreshed.
    pub failed: Vec<(String, String)>,
}

pub fn detect_argv(agent_binary: &str) -> Vec<String> {
    vec![
        agent_binary.to_string(),
        "detect".to_string(),
        "--json".to_string(),
    ]
}

pub fn decode_report(destination: &str, stdout: &str) -> Result<NodeReport, CollectError> {
    serde_json::from_str(stdout.trim()).map_err(|source| CollectError::Decode {
        destination: destination.to_string(),
        source,
    })
}

/// Run detection on one node and return its report without storing it.
pub async fn collect_node_report(
    distributor: &CodeDistributor,
    record: &NodeRecord,
    timeout: Duration,
) -> Result<NodeReport, CollectError> {
    let target = distributor.target_for_node(record);
    let output = target
        .run(&detect_argv(distributor.agent_binary()), timeout)
        .await?;
    if !output.success() {
        return Err(CollectError::RemoteExit {
            destination: target.destination(),
            status: output
                .code()
                .map(|c| format!("exit {c}"))
                .unwrap_or_else(|| "signal".to_string()),
            output: output.combined(),
        });
    }
    decode_report(&target.destination(), &output.stdout)
}

/// Refresh the stored report of every node. Unreachable nodes keep their
/// previous report, which ages into staleness.
pub async fn collect_fleet(
    store: &dyn FleetStore,
    distributor: &CodeDistributor,
    concurrency: usize,
    timeout: Duration,
) -> Result<CollectSummary, StoreError> {
    let nodes = store.list_nodes().await?;
    let mut tasks = futures_util::stream::iter(nodes.into_iter().map(|record| async move {
        let result = collect_node_report(distributor, &record, timeout).await;
        (record.node_id, result)
    }))
    .buffer_unordered(concurrency.max(1));

    let mut summary = CollectSummary::default();
    while let Some((node_id, result)) = tasks.next().await {
        let stored = match result {
            Ok(report) => store
                .record_report(&node_id, report)
                .await
                .map_err(CollectError::from),
            Err(err) => Err(err),
        };
        match stored {
            Ok(()) => {
                telemetry::record_report_collection("ok");
                debug!(node_id = %node_id, "node report collected");
                summary.collected.push(node_id);
            }
            Err(err) => {
                telemetry::record_report_collection(err.code());
                warn!(node_id = %node_id, error = %err, "node report collection failed");
                summary.failed.push((node_id, err.to_string()));
            }
        }
    }
    summary.collected.sort();
    summary.failed.sort();
    info!(
        collected = summary.collected.len(),
        failed = summary.failed.len(),
        "report collection finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::roles::RoleState;

    #[test]
    fn detect_argv_requests_json() {
        assert_eq!(
            detect_argv("/usr/local/bin/rolefleet-agent"),
            vec!["/usr/local/bin/rolefleet-agent", "detect", "--json"]
        );
    }

    #[test]
    fn decode_report_reads_agent_output() {
        let raw = r#"
            {"reported_at":"2026-01-02T03:04:05Z",
             "roles":{"web":{"path_exists":true,"path":"/srv/web","service_running":true,
                             "service_name":"nginx","ports":[80],"version":"abc1234","status":"active"}},
             "services":[{"name":"web","port":80,"healthy":true}]}
        "#;
        let report = decode_report("root@10.0.0.1", raw).expect("decode");
        assert_eq!(report.roles["web"].status, RoleState::Active);
        assert_eq!(report.services.len(), 1);
        assert!(report.agent_version.is_none());
    }

    #[test]
    fn decode_report_rejects_garbage() {
        let err = decode_report("root@10.0.0.1", "bash: rolefleet-agent: not found")
            .expect_err("garbage");
        assert_eq!(err.code(), "collect_decode");
        assert!(err.to_string().contains("root@10.0.0.1"));
    }
}
