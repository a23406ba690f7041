//! Service discovery over the latest node reports.
//!
//! Records are recomputed from the fleet store on every query. A service with
//! no instances is [`DiscoveryError::NotFound`]; a service whose instances are
//! all unhealthy is a normal result with `healthy == false`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::fleet::ServiceDiscoveryRecord;
use tracing::warn;

use crate::error::DiscoveryError;
use crate::store::{FleetStore, NodeRecord};

pub struct ServiceDiscovery {
    store: Arc<dyn FleetStore>,
    stale_after: Duration,
}

impl ServiceDiscovery {
    pub fn new(store: Arc<dyn FleetStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// One instance of `service_name`. With `prefer_healthy`, a healthy
    /// instance wins when one exists; otherwise any instance is returned.
    pub async fn discover(
        &self,
        service_name: &str,
        prefer_healthy: bool,
    ) -> Result<ServiceDiscoveryRecord, DiscoveryError> {
        let mut instances = self.discover_all(service_name).await?;
        if !prefer_healthy {
            instances.sort_by(|a, b| a.node_id.cmp(&b.node_id).then(a.port.cmp(&b.port)));
        }
        instances
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NotFound(service_name.to_string()))
    }

    /// Every instance of `service_name`, healthy ones first.
    pub async fn discover_all(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceDiscoveryRecord>, DiscoveryError> {
        let instances: Vec<_> = self
            .records(Utc::now())
            .await?
            .into_iter()
            .filter(|r| r.service_name == service_name)
            .collect();
        if instances.is_empty() {
            return Err(DiscoveryError::NotFound(service_name.to_string()));
        }
        Ok(instances)
    }

    /// The whole catalog grouped by service name.
    pub async fn discover_all_services(
        &self,
        healthy_only: bool,
    ) -> Result<BTreeMap<String, Vec<ServiceDiscoveryRecord>>, DiscoveryError> {
        let mut catalog: BTreeMap<String, Vec<ServiceDiscoveryRecord>> = BTreeMap::new();
        for record in self.records(Utc::now()).await? {
            if healthy_only && !record.healthy {
                continue;
            }
            catalog
                .entry(record.service_name.clone())
                .or_default()
                .push(record);
        }
        Ok(catalog)
    }

    async fn records(&self, now: DateTime<Utc>) -> Result<Vec<ServiceDiscoveryRecord>, DiscoveryError> {
        let nodes = self.store.list_nodes().await?;
        let mut records: Vec<ServiceDiscoveryRecord> = nodes
            .iter()
            .flat_map(|node| node_records(node, now, self.stale_after))
            .collect();
        sort_records(&mut records);
        Ok(records)
    }
}

fn node_records(node: &NodeRecord, now: DateTime<Utc>, stale_after: Duration) -> Vec<ServiceDiscoveryRecord> {
    let Some(report) = &node.last_report else {
        return Vec::new();
    };
    let fresh = report_is_fresh(&node.node_id, report.reported_at, now, stale_after);

    report
        .services
        .iter()
        .map(|service| ServiceDiscoveryRecord {
            service_name: service.name.clone(),
            node_id: node.node_id.clone(),
            host: node.host.clone(),
            port: service.port,
            protocol: service.protocol.clone(),
            endpoint_path: service.endpoint_path.clone(),
            healthy: fresh && service.healthy,
        })
        .collect()
}

/// A report is fresh when its timestamp lies within `stale_after` of `now`
/// in either direction. Clock skew beyond that window is treated as stale.
fn report_is_fresh(node_id: &str, reported_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match now.signed_duration_since(reported_at).to_std() {
        Ok(age) => age <= stale_after,
        Err(_) => {
            let ahead = reported_at.signed_duration_since(now).to_std().unwrap_or_default();
            if ahead <= stale_after {
                return true;
            }
            warn!(
                node = %node_id,
                reported_at = %reported_at,
                ahead_secs = ahead.as_secs(),
                "report is stamped too far in the future; treating it as stale"
            );
            false
        }
    }
}

/// Healthy first, then node id, then port.
fn sort_records(records: &mut [ServiceDiscoveryRecord]) {
    records.sort_by(|a, b| {
        b.healthy
            .cmp(&a.healthy)
            .then_with(|| a.service_name.cmp(&b.service_name))
            .then_with(|| a.node_id.cmp(&b.node_id))
            .then_with(|| a.port.cmp(&b.port))
    });
}
