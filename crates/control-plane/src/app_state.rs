use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::discovery::ServiceDiscovery;
use crate::distributor::CodeDistributor;
use crate::manifest::ManifestLoader;
use crate::reconcile::{Reconciler, ReportCollection};
use crate::store::{FleetStore, InMemoryFleetStore};

/// Shared components wired from configuration.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub loader: Arc<ManifestLoader>,
    pub store: Arc<dyn FleetStore>,
    pub distributor: Arc<CodeDistributor>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let store = match &config.inventory_path {
            Some(path) => InMemoryFleetStore::from_inventory_file(path)?,
            None => {
                warn!("no inventory_path configured; starting with an empty fleet");
                InMemoryFleetStore::new()
            }
        };
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn FleetStore>) -> Self {
        let loader = Arc::new(ManifestLoader::new(
            config.infra_base.clone(),
            config.manifest_ttl(),
        ));
        let distributor = Arc::new(CodeDistributor::from_config(&config));
        info!(
            infra_base = %config.infra_base.display(),
            manifest_ttl_secs = config.manifest_ttl_secs,
            "control plane state initialized"
        );
        Self {
            config,
            loader,
            store,
            distributor,
        }
    }

    pub fn discovery(&self) -> ServiceDiscovery {
        ServiceDiscovery::new(self.store.clone(), self.config.reconcile.stale_after())
    }

    pub fn report_collection(&self) -> ReportCollection {
        ReportCollection {
            distributor: self.distributor.clone(),
            concurrency: self.config.reconcile.collect_concurrency,
            timeout: self.config.ssh.command_timeout(),
        }
    }

    /// Reconciler that pulls fresh reports before each sweep when `collect`
    /// is set.
    pub fn reconciler(&self, target_commit: Option<String>, collect: bool) -> Reconciler {
        let reconciler = Reconciler::new(
            self.store.clone(),
            self.loader.clone(),
            self.config.reconcile.interval(),
        )
        .with_target_commit(target_commit);
        if collect {
            reconciler.with_collection(self.report_collection())
        } else {
            reconciler
        }
    }
}
