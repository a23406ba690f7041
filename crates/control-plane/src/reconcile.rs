//! Desired versus actual state per node.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use common::roles::{RoleManifest, RoleState};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collector;
use crate::distributor::CodeDistributor;
use crate::error::StoreError;
use crate::manifest::ManifestLoader;
use crate::policy::{self, NodePolicy};
use crate::store::{FleetStore, NodeRecord};
use crate::telemetry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionDrift {
    pub role: String,
    pub reported: Option<String>,
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReconciliation {
    pub node_id: String,
    pub policy: NodePolicy,
    /// False until the node has reported at least once.
    pub reported: bool,
    /// Assigned but not installed, or absent from the report.
    pub missing: Vec<String>,
    /// Assigned and installed with a stopped service.
    pub inactive: Vec<String>,
    /// Installed on the node without being assigned.
    pub unexpected: Vec<String>,
    pub version_drift: Vec<VersionDrift>,
    pub agent_commit: Option<String>,
    /// Agent code differs from the target commit.
    pub agent_outdated: bool,
}

impl NodeReconciliation {
    pub fn has_drift(&self) -> bool {
        !self.missing.is_empty()
            || !self.inactive.is_empty()
            || !self.unexpected.is_empty()
            || !self.version_drift.is_empty()
            || self.agent_outdated
    }

    pub fn is_converged(&self) -> bool {
        self.reported && !self.has_drift() && !self.policy.is_blocked()
    }
}

/// Abbreviated and full hashes of the same commit compare equal.
fn same_commit(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_ascii_lowercase(), b.to_ascii_lowercase());
    let shortest = a.len().min(b.len());
    shortest >= 7 && a[..shortest] == b[..shortest]
}

pub fn reconcile_node(
    record: &NodeRecord,
    manifests: &HashMap<String, Arc<RoleManifest>>,
    target_commit: Option<&str>,
) -> NodeReconciliation {
    let policy = policy::resolve(&record.assigned_roles, manifests);
    let report = record.last_report.as_ref();

    let mut missing = Vec::new();
    let mut inactive = Vec::new();
    let mut version_drift = Vec::new();

    for role in &policy.roles {
        let Some(status) = report.and_then(|r| r.roles.get(role)) else {
            missing.push(role.clone());
            continue;
        };
        match status.status {
            RoleState::NotInstalled => {
                missing.push(role.clone());
                continue;
            }
            RoleState::Inactive => inactive.push(role.clone()),
            RoleState::Active => {}
        }
        if let Some(expected) = target_commit {
            let current = status.version.as_deref().is_some_and(|v| same_commit(v, expected));
            if !current {
                version_drift.push(VersionDrift {
                    role: role.clone(),
                    reported: status.version.clone(),
                    expected: expected.to_string(),
                });
            }
        }
    }

    let assigned: BTreeSet<&str> = policy.roles.iter().map(String::as_str).collect();
    let mut unexpected: Vec<String> = report
        .map(|r| {
            r.roles
                .iter()
                .filter(|(name, status)| {
                    status.status != RoleState::NotInstalled && !assigned.contains(name.as_str())
                })
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();
    unexpected.sort();

    let agent_commit = report
        .and_then(|r| r.agent_version.as_ref())
        .map(|v| v.commit.clone());
    let agent_outdated = match (target_commit, agent_commit.as_deref()) {
        (Some(expected), Some(actual)) => !same_commit(actual, expected),
        (Some(_), None) => report.is_some(),
        (None, _) => false,
    };

    NodeReconciliation {
        node_id: record.node_id.clone(),
        policy,
        reported: report.is_some(),
        missing,
        inactive,
        unexpected,
        version_drift,
        agent_commit,
        agent_outdated,
    }
}

/// Reconcile every node in the store, loading each assigned manifest once.
pub async fn reconcile_fleet(
    store: &dyn FleetStore,
    loader: &ManifestLoader,
    target_commit: Option<&str>,
) -> Result<Vec<NodeReconciliation>, StoreError> {
    let nodes = store.list_nodes().await?;
    let roles: BTreeSet<String> = nodes
        .iter()
        .flat_map(|n| n.assigned_roles.iter().cloned())
        .collect();
    let manifests = loader.load_many(&roles);

    let results: Vec<NodeReconciliation> = nodes
        .iter()
        .map(|node| reconcile_node(node, &manifests, target_commit))
        .collect();

    let blocked = results.iter().filter(|r| r.policy.is_blocked()).count();
    let drifted = results.iter().filter(|r| r.has_drift()).count();
    telemetry::record_reconcile_sweep(results.len(), blocked, drifted);

    for result in &results {
        if result.policy.is_blocked() {
            let pairs: Vec<String> = result.policy.hard_conflicts.iter().map(|p| p.to_string()).collect();
            warn!(node_id = %result.node_id, conflicts = %pairs.join(", "), "node has blocking role conflicts");
        }
        if !result.reported {
            warn!(node_id = %result.node_id, "node has not reported yet");
        } else if result.has_drift() {
            info!(
                node_id = %result.node_id,
                missing = ?result.missing,
                inactive = ?result.inactive,
                unexpected = ?result.unexpected,
                version_drift = result.version_drift.len(),
                agent_outdated = result.agent_outdated,
                "node drifted from assignment"
            );
        } else {
            debug!(node_id = %result.node_id, "node converged");
        }
    }
    Ok(results)
}

/// Pull reports over SSH before reconciling.
#[derive(Clone)]
pub struct ReportCollection {
    pub distributor: Arc<CodeDistributor>,
    pub concurrency: usize,
    pub timeout: Duration,
}

/// Periodic reconcile sweep.
pub struct Reconciler {
    store: Arc<dyn FleetStore>,
    loader: Arc<ManifestLoader>,
    interval: Duration,
    collection: Option<ReportCollection>,
    target_commit: Option<String>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn FleetStore>, loader: Arc<ManifestLoader>, interval: Duration) -> Self {
        Self {
            store,
            loader,
            interval,
            collection: None,
            target_commit: None,
        }
    }

    pub fn with_collection(mut self, collection: ReportCollection) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn with_target_commit(mut self, commit: Option<String>) -> Self {
        self.target_commit = commit;
        self
    }

    pub async fn sweep(&self) -> Result<Vec<NodeReconciliation>, StoreError> {
        if let Some(collection) = &self.collection {
            collector::collect_fleet(
                self.store.as_ref(),
                &collection.distributor,
                collection.concurrency,
                collection.timeout,
            )
            .await?;
        }
        reconcile_fleet(
            self.store.as_ref(),
            &self.loader,
            self.target_commit.as_deref(),
        )
        .await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "reconcile loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(err) = self.sweep().await {
                        warn!(error = %err, code = err.code(), "reconcile sweep failed");
                    }
                }
            }
        }
        info!("reconcile loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILE;
    use crate::store::InMemoryFleetStore;
    use chrono::Utc;
    use common::fleet::NodeReport;
    use common::roles::{AgentVersion, Coexistence, RoleStatus};

    fn status(state: RoleState, version: Option<&str>) -> RoleStatus {
        RoleStatus {
            path_exists: state != RoleState::NotInstalled,
            path: None,
            service_running: state == RoleState::Active,
            service_name: None,
            ports: vec![],
            version: version.map(str::to_string),
            status: state,
        }
    }

    fn manifests(names: &[&str]) -> HashMap<String, Arc<RoleManifest>> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Arc::new(RoleManifest {
                        name: n.to_string(),
                        ..Default::default()
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn unreported_node_is_missing_everything() {
        let record = NodeRecord::new("n1", "10.0.0.1").with_roles(["web", "db"]);
        let result = reconcile_node(&record, &manifests(&["web", "db"]), Some("abc1234"));
        assert!(!result.reported);
        assert_eq!(result.missing, vec!["db", "web"]);
        assert!(!result.agent_outdated);
        assert!(!result.is_converged());
    }

    #[test]
    fn classifies_missing_inactive_unexpected_and_drift() {
        let mut report = NodeReport::new(Utc::now());
        report.roles.insert("web".into(), status(RoleState::Active, Some("abc1234")));
        report.roles.insert("db".into(), status(RoleState::Inactive, Some("0000000")));
        report.roles.insert("cache".into(), status(RoleState::NotInstalled, None));
        report.roles.insert("legacy".into(), status(RoleState::Active, None));
        report.roles.insert("old".into(), status(RoleState::NotInstalled, None));
        report.agent_version = Some(AgentVersion {
            commit: "abc1234def".into(),
            built_at: Utc::now(),
            updated_at: None,
        });

        let mut record = NodeRecord::new("n1", "10.0.0.1").with_roles(["web", "db", "cache", "queue"]);
        record.last_report = Some(report);

        let result = reconcile_node(
            &record,
            &manifests(&["web", "db", "cache", "queue"]),
            Some("abc1234def5678"),
        );
        assert_eq!(result.missing, vec!["cache", "queue"]);
        assert_eq!(result.inactive, vec!["db"]);
        assert_eq!(result.unexpected, vec!["legacy"]);
        assert_eq!(
            result.version_drift,
            vec![VersionDrift {
                role: "db".into(),
                reported: Some("0000000".into()),
                expected: "abc1234def5678".into(),
            }]
        );
        assert_eq!(result.agent_commit.as_deref(), Some("abc1234def"));
        assert!(!result.agent_outdated);
        assert!(result.has_drift());
    }

    #[test]
    fn converged_node_without_target_commit() {
        let mut report = NodeReport::new(Utc::now());
        report.roles.insert("web".into(), status(RoleState::Active, None));
        let mut record = NodeRecord::new("n1", "10.0.0.1").with_roles(["web"]);
        record.last_report = Some(report);

        let result = reconcile_node(&record, &manifests(&["web"]), None);
        assert!(result.is_converged());
    }

    #[test]
    fn blocked_node_is_never_converged() {
        let mut m = manifests(&["redis", "redis-cluster"]);
        m.insert(
            "redis".into(),
            Arc::new(RoleManifest {
                name: "redis".into(),
                coexistence: Coexistence {
                    hard_conflicts: vec!["redis-cluster".into()],
                    warns_with: vec![],
                },
                ..Default::default()
            }),
        );
        let mut report = NodeReport::new(Utc::now());
        report.roles.insert("redis".into(), status(RoleState::Active, None));
        report.roles.insert("redis-cluster".into(), status(RoleState::Active, None));
        let mut record = NodeRecord::new("n1", "10.0.0.1").with_roles(["redis", "redis-cluster"]);
        record.last_report = Some(report);

        let result = reconcile_node(&record, &m, None);
        assert!(!result.has_drift());
        assert!(result.policy.is_blocked());
        assert!(!result.is_converged());
    }

    #[test]
    fn commit_prefixes_match() {
        assert!(same_commit("ABC1234", "abc1234ffff"));
        assert!(!same_commit("abc", "abc"));
        assert!(!same_commit("abc1234", "abc1235"));
    }

    #[tokio::test]
    async fn reconcile_fleet_loads_manifests_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("web")).expect("mkdir");
        std::fs::write(dir.path().join("web").join(MANIFEST_FILE), "name: web\n").expect("write");
        let loader = ManifestLoader::new(dir.path(), Duration::from_secs(60));
        let store = InMemoryFleetStore::from_records(vec![
            NodeRecord::new("b", "10.0.0.2").with_roles(["web", "ghost"]),
            NodeRecord::new("a", "10.0.0.1").with_roles(["web"]),
        ])
        .expect("store");

        let results = reconcile_fleet(&store, &loader, None).await.expect("reconcile");
        let ids: Vec<_> = results.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(results[1].policy.unmanaged_roles, vec!["ghost"]);
    }

    #[tokio::test]
    async fn reconciler_stops_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reconciler = Reconciler::new(
            Arc::new(InMemoryFleetStore::new()),
            Arc::new(ManifestLoader::new(dir.path(), Duration::from_secs(60))),
            Duration::from_millis(10),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop stops")
            .expect("join");
    }
}
