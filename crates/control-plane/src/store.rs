use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use common::fleet::NodeReport;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::StoreError;

/// One managed node and the roles an operator assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    /// IP address or hostname used for SSH and advertised to discovery clients.
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub assigned_roles: Vec<String>,
    #[serde(default)]
    pub last_report: Option<NodeReport>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            host: host.into(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            assigned_roles: Vec::new(),
            last_report: None,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assigned_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.node_id.trim().is_empty() {
            return Err(StoreError::Invalid("node_id cannot be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(StoreError::Invalid(format!(
                "node '{}' has an empty host",
                self.node_id
            )));
        }
        if self.ssh_port == 0 {
            return Err(StoreError::Invalid(format!(
                "node '{}' has ssh_port 0",
                self.node_id
            )));
        }
        Ok(())
    }
}

/// CRUD surface over fleet state; the relational backend lives outside this
/// crate.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// All nodes, sorted by node id.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError>;
    async fn get_node(&self, node_id: &str) -> Result<NodeRecord, StoreError>;
    async fn upsert_node(&self, record: NodeRecord) -> Result<(), StoreError>;
    /// Replace the latest report for an existing node.
    async fn record_report(&self, node_id: &str, report: NodeReport) -> Result<(), StoreError>;
}

#[derive(Debug, Deserialize)]
struct Inventory {
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryFleetStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<NodeRecord>) -> Result<Self, StoreError> {
        let mut nodes = HashMap::new();
        for record in records {
            record.validate()?;
            if nodes.contains_key(&record.node_id) {
                return Err(StoreError::Invalid(format!(
                    "duplicate node_id '{}'",
                    record.node_id
                )));
            }
            nodes.insert(record.node_id.clone(), record);
        }
        Ok(Self {
            nodes: RwLock::new(nodes),
        })
    }

    /// Seed from a YAML inventory of the form `nodes: [NodeRecord, ...]`.
    pub fn from_inventory_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let inventory: Inventory = serde_yaml::from_str(&raw).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_records(inventory.nodes)?;
        info!(path = %path.display(), "fleet inventory loaded");
        Ok(store)
    }
}

#[async_trait]
impl FleetStore for InMemoryFleetStore {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let nodes = self.nodes.read().await;
        let mut records: Vec<NodeRecord> = nodes.values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(records)
    }

    async fn get_node(&self, node_id: &str) -> Result<NodeRecord, StoreError> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))
    }

    async fn upsert_node(&self, record: NodeRecord) -> Result<(), StoreError> {
        record.validate()?;
        self.nodes
            .write()
            .await
            .insert(record.node_id.clone(), record);
        Ok(())
    }

    async fn record_report(&self, node_id: &str, report: NodeReport) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))?;
        record.last_report = Some(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn crud_roundtrip() {
        let store = InMemoryFleetStore::new();
        store
            .upsert_node(NodeRecord::new("n2", "10.0.0.2").with_roles(["web"]))
            .await
            .expect("upsert n2");
        store
            .upsert_node(NodeRecord::new("n1", "10.0.0.1"))
            .await
            .expect("upsert n1");

        let ids: Vec<_> = store
            .list_nodes()
            .await
            .expect("list")
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(ids, vec!["n1", "n2"]);

        let report = NodeReport::new(Utc::now());
        store.record_report("n2", report.clone()).await.expect("report");
        let n2 = store.get_node("n2").await.expect("get");
        assert_eq!(n2.assigned_roles, vec!["web".to_string()]);
        assert_eq!(n2.last_report, Some(report));

        assert!(matches!(
            store.get_node("nope").await,
            Err(StoreError::NodeNotFound(_))
        ));
        assert!(matches!(
            store.record_report("nope", NodeReport::new(Utc::now())).await,
            Err(StoreError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn upsert_rejects_invalid_records() {
        let store = InMemoryFleetStore::new();
        let err = store
            .upsert_node(NodeRecord::new("n1", " "))
            .await
            .expect_err("empty host");
        assert_eq!(err.code(), "invalid_node");
    }

    #[tokio::test]
    async fn inventory_file_seeds_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nodes.yml");
        std::fs::write(
            &path,
            r#"
nodes:
  - node_id: cache-1
    host: 10.0.0.5
    ssh_user: deploy
    ssh_port: 2222
    assigned_roles: [redis-server]
  - node_id: web-1
    host: web-1.internal
"#,
        )
        .expect("write");

        let store = InMemoryFleetStore::from_inventory_file(&path).expect("load");
        let cache = store.get_node("cache-1").await.expect("cache-1");
        assert_eq!(cache.ssh_user, "deploy");
        assert_eq!(cache.ssh_port, 2222);
        let web = store.get_node("web-1").await.expect("web-1");
        assert_eq!(web.ssh_user, "root");
        assert_eq!(web.ssh_port, 22);
        assert!(web.assigned_roles.is_empty());
    }

    #[test]
    fn duplicate_inventory_ids_are_rejected() {
        let err = InMemoryFleetStore::from_records(vec![
            NodeRecord::new("n1", "a"),
            NodeRecord::new("n1", "b"),
        ])
        .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"), "{err}");
    }
}
