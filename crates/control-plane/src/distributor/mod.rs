//! Code packaging and remote activation.
//!
//! Packages are built once per commit, verified before they leave the control
//! plane, staged on nodes over SSH and activated by the node's own agent.

pub mod package;
pub mod rollout;
pub mod ssh;
pub mod sync;

use std::path::PathBuf;
use std::time::Duration;

use common::fleet::STAGED_PACKAGE_FILE;

use crate::config::AppConfig;
use crate::error::DistributorError;
use crate::store::NodeRecord;

pub use package::{verify_package, CodePackage, PackageBuilder};
pub use rollout::{NodeRolloutResult, NodeRolloutStatus, RolloutOptions, RolloutReport, RolloutTarget};
pub use ssh::{SshOptions, SshTarget};
pub use sync::{SyncFailureKind, SyncOutcome};

pub struct CodeDistributor {
    builder: PackageBuilder,
    ssh: SshOptions,
    agent_binary: String,
    staging_dir: String,
    sync_timeout: Duration,
    upload_timeout: Duration,
}

impl CodeDistributor {
    pub fn new(builder: PackageBuilder, ssh: SshOptions, agent_binary: impl Into<String>, staging_dir: impl Into<String>) -> Self {
        Self {
            builder,
            ssh,
            agent_binary: agent_binary.into(),
            staging_dir: staging_dir.into(),
            sync_timeout: Duration::from_secs(120),
            upload_timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        let builder = PackageBuilder::new(
            &cfg.packages.dir,
            &cfg.packages.agent_source_dir,
            &cfg.packages.repo_dir,
        );
        Self::new(
            builder,
            SshOptions::from(&cfg.ssh),
            cfg.ssh.agent_binary.clone(),
            cfg.ssh.staging_dir.clone(),
        )
        .with_timeouts(cfg.ssh.command_timeout(), cfg.ssh.upload_timeout())
    }

    pub fn with_timeouts(mut self, sync_timeout: Duration, upload_timeout: Duration) -> Self {
        self.sync_timeout = sync_timeout;
        self.upload_timeout = upload_timeout;
        self
    }

    pub fn builder(&self) -> &PackageBuilder {
        &self.builder
    }

    /// Agent executable invoked on nodes.
    pub fn agent_binary(&self) -> &str {
        &self.agent_binary
    }

    pub fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    pub async fn build_package(&self, commit: Option<&str>) -> Result<CodePackage, DistributorError> {
        self.builder.build_package(commit).await
    }

    pub fn target_for(&self, ip_address: &str, ssh_user: &str, ssh_port: u16) -> SshTarget {
        SshTarget::new(
            ip_address,
            Some(ssh_user.to_string()),
            ssh_port,
            self.ssh.clone(),
        )
    }

    pub fn target_for_node(&self, node: &NodeRecord) -> SshTarget {
        self.target_for(&node.host, &node.ssh_user, node.ssh_port)
    }

    pub fn staged_package_path(&self) -> PathBuf {
        PathBuf::from(&self.staging_dir).join(STAGED_PACKAGE_FILE)
    }

    /// Upload the tarball and its checksum file to the node's staging
    /// directory, tarball first.
    pub async fn stage_package(&self, target: &SshTarget, package: &CodePackage) -> Result<(), DistributorError> {
        let remote = self.staged_package_path();
        let remote_sha = common::checksum::sha256_path_for(&remote);
        target
            .upload_file(&package.tarball_path, &remote, self.upload_timeout)
            .await?;
        target
            .upload_file(&package.checksum_path(), &remote_sha, self.upload_timeout)
            .await?;
        Ok(())
    }
}
