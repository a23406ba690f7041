//! Activation of a staged code package.
//!
//! The control plane uploads `agent-package.tar.gz` and its `.sha256` into the
//! staging directory. `sync` verifies the pair, unpacks it into
//! `releases/<commit>`, repoints `current` and records the new version. A
//! package that fails verification is deleted and never unpacked.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use common::checksum::{sha256_path_for, verify_sha256, ChecksumError};
use common::command::{CommandError, CommandSpec};
use common::fleet::STAGED_PACKAGE_FILE;
use common::roles::{AgentVersion, SyncStrategy};
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::telemetry;
use crate::version::{write_agent_version, VERSION_FILE_NAME};

const PACKAGE_AGENT_DIR: &str = "agent";
const RELEASES_DIR: &str = "releases";
const CURRENT_LINK: &str = "current";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no staged package at {0}")]
    MissingPackage(PathBuf),
    #[error("failed to read package checksum: {0}")]
    Checksum(#[source] ChecksumError),
    #[error("package failed integrity check, staged files removed: {0}")]
    Integrity(#[source] ChecksumError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid package archive: {0}")]
    Archive(String),
    #[error("package contains unsafe entry {0}")]
    UnsafeEntry(String),
    #[error("package has no usable version.json: {0}")]
    MissingVersion(String),
    #[error("restart failed ({command}): {message}")]
    Restart { command: String, message: String },
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::MissingPackage(_) => "missing_package",
            SyncError::Checksum(_) => "checksum_unreadable",
            SyncError::Integrity(_) => "integrity_mismatch",
            SyncError::Io { .. } => "io",
            SyncError::Archive(_) => "archive",
            SyncError::UnsafeEntry(_) => "unsafe_entry",
            SyncError::MissingVersion(_) => "missing_version",
            SyncError::Restart { .. } => "restart_failed",
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub restart: bool,
    pub strategy: SyncStrategy,
    /// Overrides the staged package location.
    pub package: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            restart: true,
            strategy: SyncStrategy::Graceful,
            package: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    Restarted,
    Reloaded,
    /// Manual strategy: an operator restarts the service.
    Pending,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub commit: String,
    pub release_dir: PathBuf,
    pub version: AgentVersion,
    pub strategy: SyncStrategy,
    pub restart: RestartOutcome,
}

/// Installs staged packages under `install_dir`.
#[derive(Debug, Clone)]
pub struct PackageActivator {
    install_dir: PathBuf,
    staging_dir: PathBuf,
    version_file: PathBuf,
    systemctl: String,
    agent_unit: String,
    command_timeout: Duration,
}

impl PackageActivator {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            install_dir: cfg.install_dir.clone(),
            staging_dir: cfg.staging_dir.clone(),
            version_file: cfg.version_file.clone(),
            systemctl: cfg.systemctl.clone(),
            agent_unit: cfg.agent_unit.clone(),
            command_timeout: cfg.command_timeout(),
        }
    }

    pub fn staged_package(&self) -> PathBuf {
        self.staging_dir.join(STAGED_PACKAGE_FILE)
    }

    pub fn current_link(&self) -> PathBuf {
        self.install_dir.join(CURRENT_LINK)
    }

    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let result = self.activate(options).await;
        match &result {
            Ok(report) => {
                telemetry::record_sync_result("ok");
                info!(
                    commit = %report.commit,
                    strategy = report.strategy.as_str(),
                    restart = ?report.restart,
                    "package activated"
                );
            }
            Err(err) => {
                telemetry::record_sync_result(err.code());
                warn!(error = %err, code = err.code(), "sync failed");
            }
        }
        result
    }

    async fn activate(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let package = options.package.clone().unwrap_or_else(|| self.staged_package());
        if !package.is_file() {
            return Err(SyncError::MissingPackage(package));
        }

        let install_dir = self.install_dir.clone();
        let staged = package.clone();
        let (version, release_dir) = tokio::task::spawn_blocking(move || {
            verify_staged(&staged)?;
            let (version, release_dir) = install_release(&staged, &install_dir)?;
            swap_current(&install_dir, &release_dir)?;
            retire_duplicate_releases(&install_dir, &version.commit, &release_dir);
            Ok::<_, SyncError>((version, release_dir))
        })
        .await
        .map_err(|err| SyncError::Archive(format!("activation task failed: {err}")))??;

        let version = AgentVersion {
            updated_at: Some(Utc::now()),
            ..version
        };
        write_agent_version(&self.version_file, &version).map_err(|err| SyncError::io(&self.version_file, err))?;
        remove_staged(&package);

        let restart = self.restart(options).await?;
        Ok(SyncReport {
            commit: version.commit.clone(),
            release_dir,
            version,
            strategy: options.strategy,
            restart,
        })
    }

    async fn restart(&self, options: &SyncOptions) -> Result<RestartOutcome, SyncError> {
        if !options.restart {
            return Ok(RestartOutcome::Skipped);
        }
        let (verb, outcome) = match options.strategy {
            SyncStrategy::Manual => {
                info!(unit = %self.agent_unit, "manual strategy: restart pending");
                return Ok(RestartOutcome::Pending);
            }
            SyncStrategy::Immediate => ("restart", RestartOutcome::Restarted),
            SyncStrategy::Graceful => ("reload-or-restart", RestartOutcome::Reloaded),
        };
        let spec = CommandSpec::new(&self.systemctl)
            .args([verb, "--", self.agent_unit.as_str()])
            .timeout(self.command_timeout);
        let output = spec.run().await.map_err(|err: CommandError| SyncError::Restart {
            command: spec.display(),
            message: err.to_string(),
        })?;
        if !output.success() {
            return Err(SyncError::Restart {
                command: spec.display(),
                message: output.combined(),
            });
        }
        Ok(outcome)
    }
}

fn verify_staged(package: &Path) -> Result<(), SyncError> {
    let sha_file = sha256_path_for(package);
    match verify_sha256(package, &sha_file) {
        Ok(()) => Ok(()),
        Err(err @ ChecksumError::Mismatch { .. }) => {
            remove_staged(package);
            Err(SyncError::Integrity(err))
        }
        Err(err) => Err(SyncError::Checksum(err)),
    }
}

fn remove_staged(package: &Path) {
    for path in [package.to_path_buf(), sha256_path_for(package)] {
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %err, "failed to remove staged file");
            }
        }
    }
}

/// Only `agent/...` and the top-level `version.json` are accepted, as plain
/// relative paths.
fn check_entry_path(path: &Path) -> Result<(), SyncError> {
    let rendered = path.display().to_string();
    let mut components = path.components();
    let first = match components.next() {
        Some(Component::Normal(first)) => first,
        _ => return Err(SyncError::UnsafeEntry(rendered)),
    };
    if !components.all(|c| matches!(c, Component::Normal(_))) {
        return Err(SyncError::UnsafeEntry(rendered));
    }
    let top_level_version = first == VERSION_FILE_NAME && path.components().count() == 1;
    if first != PACKAGE_AGENT_DIR && !top_level_version {
        return Err(SyncError::UnsafeEntry(rendered));
    }
    Ok(())
}

fn unpack_archive(package: &Path, dest: &Path) -> Result<(), SyncError> {
    let file = fs::File::open(package).map_err(|err| SyncError::io(package, err))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|err| SyncError::Archive(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| SyncError::Archive(err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| SyncError::Archive(err.to_string()))?
            .into_owned();
        check_entry_path(&path)?;
        match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Directory => {}
            other => {
                return Err(SyncError::UnsafeEntry(format!(
                    "{} ({other:?})",
                    path.display()
                )))
            }
        }
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|err| SyncError::Archive(format!("{}: {err}", path.display())))?;
        if !unpacked {
            return Err(SyncError::UnsafeEntry(path.display().to_string()));
        }
    }
    Ok(())
}

fn read_package_version(dir: &Path) -> Result<AgentVersion, SyncError> {
    let path = dir.join(VERSION_FILE_NAME);
    let raw = fs::read_to_string(&path).map_err(|err| SyncError::MissingVersion(err.to_string()))?;
    let version: AgentVersion =
        serde_json::from_str(&raw).map_err(|err| SyncError::MissingVersion(err.to_string()))?;
    let commit = version.commit.trim().to_string();
    if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SyncError::MissingVersion(format!(
            "invalid commit '{}'",
            version.commit
        )));
    }
    Ok(AgentVersion {
        commit,
        updated_at: None,
        ..version
    })
}

/// Unpack `package` into a new release directory. The first copy of a commit
/// lands in `releases/<commit>`; a re-install of a commit that is already
/// present gets a fresh `releases/<commit>.<micros>` so the live directory
/// stays intact until `current` has moved off it.
fn install_release(package: &Path, install_dir: &Path) -> Result<(AgentVersion, PathBuf), SyncError> {
    let releases = install_dir.join(RELEASES_DIR);
    fs::create_dir_all(&releases).map_err(|err| SyncError::io(&releases, err))?;
    let incoming = releases.join(format!(".incoming-{}", std::process::id()));
    if incoming.exists() {
        fs::remove_dir_all(&incoming).map_err(|err| SyncError::io(&incoming, err))?;
    }
    fs::create_dir(&incoming).map_err(|err| SyncError::io(&incoming, err))?;

    let result = unpack_archive(package, &incoming)
        .and_then(|_| read_package_version(&incoming))
        .and_then(|version| {
            let mut release_dir = releases.join(&version.commit);
            if release_dir.exists() {
                release_dir = releases.join(format!("{}.{}", version.commit, Utc::now().timestamp_micros()));
                debug!(path = %release_dir.display(), "commit already installed; unpacking a fresh copy");
            }
            fs::rename(&incoming, &release_dir).map_err(|err| SyncError::io(&release_dir, err))?;
            Ok((version, release_dir))
        });

    if result.is_err() && incoming.exists() {
        if let Err(err) = fs::remove_dir_all(&incoming) {
            warn!(path = %incoming.display(), %err, "failed to clean up partial release");
        }
    }
    result
}

/// Remove other copies of `commit` once `current` points at `keep`. Other
/// commits stay for rollback.
fn retire_duplicate_releases(install_dir: &Path, commit: &str, keep: &Path) {
    let releases = install_dir.join(RELEASES_DIR);
    let entries = match fs::read_dir(&releases) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %releases.display(), %err, "cannot list releases");
            return;
        }
    };
    let copy_prefix = format!("{commit}.");
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path == keep || !(name == commit || name.starts_with(&copy_prefix)) {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "retired duplicate release"),
            Err(err) => warn!(path = %path.display(), %err, "failed to retire duplicate release"),
        }
    }
}

/// Repoint `current` through a temporary link and a rename.
fn swap_current(install_dir: &Path, release_dir: &Path) -> Result<(), SyncError> {
    let current = install_dir.join(CURRENT_LINK);
    let tmp = install_dir.join(format!("{CURRENT_LINK}.tmp"));
    let target = release_dir
        .strip_prefix(install_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| release_dir.to_path_buf());

    if fs::symlink_metadata(&tmp).is_ok() {
        fs::remove_file(&tmp).map_err(|err| SyncError::io(&tmp, err))?;
    }
    std::os::unix::fs::symlink(&target, &tmp).map_err(|err| SyncError::io(&tmp, err))?;
    fs::rename(&tmp, &current).map_err(|err| SyncError::io(&current, err))
}
