use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::checksum::{parse_sha256_file, sha256_hex, sha256_path_for, write_sha256_file};
use common::command::CommandSpec;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::DistributorError;
use crate::telemetry;

pub const PACKAGE_AGENT_DIR: &str = "agent";
pub const PACKAGE_VERSION_FILE: &str = "version.json";
const GIT_TIMEOUT: Duration = Duration::from_secs(15);
const SKIPPED_DIRS: &[&str] = &[".git", "target", "__pycache__", "node_modules"];

/// A built, checksummed agent tarball for one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodePackage {
    pub commit_hash: String,
    pub tarball_path: PathBuf,
    pub sha256_checksum: String,
}

impl CodePackage {
    pub fn checksum_path(&self) -> PathBuf {
        sha256_path_for(&self.tarball_path)
    }
}

#[derive(Serialize)]
struct PackageVersion<'a> {
    commit: &'a str,
    built_at: DateTime<Utc>,
}

/// Lowercase or uppercase hex, 7 to 64 characters.
pub fn is_valid_commit(commit: &str) -> bool {
    (7..=64).contains(&commit.len()) && commit.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn package_file_name(commit: &str) -> String {
    format!("agent-{commit}.tar.gz")
}

/// Builds packages once per commit and reuses them afterwards.
pub struct PackageBuilder {
    packages_dir: PathBuf,
    agent_source_dir: PathBuf,
    repo_dir: PathBuf,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PackageBuilder {
    pub fn new(packages_dir: impl Into<PathBuf>, agent_source_dir: impl Into<PathBuf>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: packages_dir.into(),
            agent_source_dir: agent_source_dir.into(),
            repo_dir: repo_dir.into(),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    pub fn tarball_path(&self, commit: &str) -> PathBuf {
        self.packages_dir.join(package_file_name(commit))
    }

    /// `git rev-parse HEAD` in the configured repository.
    pub async fn resolve_head(&self) -> Result<String, DistributorError> {
        let output = CommandSpec::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.repo_dir)
            .timeout(GIT_TIMEOUT)
            .run()
            .await
            .map_err(|err| DistributorError::ResolveHead(err.to_string()))?;
        if !output.success() {
            return Err(DistributorError::ResolveHead(output.combined()));
        }
        let commit = output.stdout.trim().to_ascii_lowercase();
        if !is_valid_commit(&commit) {
            return Err(DistributorError::InvalidCommit(commit));
        }
        Ok(commit)
    }

    /// Package for `commit` (HEAD when omitted), building it only if no
    /// package exists on disk yet.
    pub async fn build_package(&self, commit: Option<&str>) -> Result<CodePackage, DistributorError> {
        let commit = match commit {
            Some(commit) => {
                let commit = commit.trim().to_ascii_lowercase();
                if !is_valid_commit(&commit) {
                    return Err(DistributorError::InvalidCommit(commit));
                }
                commit
            }
            None => self.resolve_head().await?,
        };

        let lock = self.lock_for(&commit);
        let _guard = lock.lock().await;

        if let Some(existing) = self.existing_package(&commit)? {
            info!(commit = %commit, path = %existing.tarball_path.display(), "reusing existing package");
            return Ok(existing);
        }

        if !self.agent_source_dir.is_dir() {
            return Err(DistributorError::MissingSource(self.agent_source_dir.clone()));
        }
        fs::create_dir_all(&self.packages_dir).map_err(|source| DistributorError::Io {
            path: self.packages_dir.clone(),
            source,
        })?;

        let started = Instant::now();
        let tarball = self.tarball_path(&commit);
        let source_dir = self.agent_source_dir.clone();
        let built_at = Utc::now();
        let build_commit = commit.clone();
        let build_tarball = tarball.clone();
        let result = tokio::task::spawn_blocking(move || {
            write_package(&build_tarball, &source_dir, &build_commit, built_at)
        })
        .await
        .map_err(|err| DistributorError::Join(err.to_string()))
        .and_then(|res| res);

        match result {
            Ok(sha256_checksum) => {
                telemetry::record_package_build("ok", started.elapsed());
                info!(commit = %commit, path = %tarball.display(), sha256 = %sha256_checksum, "package built");
                Ok(CodePackage {
                    commit_hash: commit,
                    tarball_path: tarball,
                    sha256_checksum,
                })
            }
            Err(err) => {
                telemetry::record_package_build("error", started.elapsed());
                warn!(commit = %commit, error = %err, "package build failed");
                Err(err)
            }
        }
    }

    fn lock_for(&self, commit: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.build_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(commit.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// A package is reusable only when both the tarball and its checksum file
    /// are present.
    pub fn existing_package(&self, commit: &str) -> Result<Option<CodePackage>, DistributorError> {
        let tarball = self.tarball_path(commit);
        let sha_path = sha256_path_for(&tarball);
        if !tarball.is_file() || !sha_path.is_file() {
            return Ok(None);
        }
        let sha256_checksum = parse_sha256_file(&sha_path)?;
        Ok(Some(CodePackage {
            commit_hash: commit.to_string(),
            tarball_path: tarball,
            sha256_checksum,
        }))
    }
}

/// Recompute the tarball checksum and compare it with the published one.
pub fn verify_package(package: &CodePackage) -> Result<(), DistributorError> {
    let actual = sha256_hex(&package.tarball_path)?;
    if actual != package.sha256_checksum {
        return Err(DistributorError::Integrity {
            path: package.tarball_path.clone(),
            expected: package.sha256_checksum.clone(),
            actual,
        });
    }
    let published = parse_sha256_file(&package.checksum_path())?;
    if published != package.sha256_checksum {
        return Err(DistributorError::Integrity {
            path: package.checksum_path(),
            expected: package.sha256_checksum.clone(),
            actual: published,
        });
    }
    Ok(())
}

fn write_package(tarball: &Path, source_dir: &Path, commit: &str, built_at: DateTime<Utc>) -> Result<String, DistributorError> {
    let partial = tarball.with_extension("gz.partial");
    let result = write_archive(&partial, source_dir, commit, built_at)
        .and_then(|_| {
            fs::rename(&partial, tarball).map_err(|source| DistributorError::Io {
                path: tarball.to_path_buf(),
                source,
            })
        })
        .and_then(|_| write_sha256_file(tarball).map_err(DistributorError::from));

    if result.is_err() {
        for path in [partial, tarball.to_path_buf(), sha256_path_for(tarball)] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "failed to remove partial package output");
                }
            }
        }
    }
    result
}

fn write_archive(path: &Path, source_dir: &Path, commit: &str, built_at: DateTime<Utc>) -> Result<(), DistributorError> {
    let build_err = |message: String| DistributorError::Build {
        commit: commit.to_string(),
        message,
    };

    let file = fs::File::create(path).map_err(|source| DistributorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder
        .append_dir(PACKAGE_AGENT_DIR, source_dir)
        .map_err(|err| build_err(format!("failed to add {}: {err}", source_dir.display())))?;
    append_tree(&mut builder, source_dir, Path::new(PACKAGE_AGENT_DIR)).map_err(build_err)?;

    let version = serde_json::to_vec_pretty(&PackageVersion { commit, built_at })
        .map_err(|err| build_err(format!("failed to encode version.json: {err}")))?;
    let mut header = tar::Header::new_gnu();
    header.set_size(version.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(built_at.timestamp().max(0) as u64);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder
        .append_data(&mut header, PACKAGE_VERSION_FILE, version.as_slice())
        .map_err(|err| build_err(format!("failed to add version.json: {err}")))?;

    let encoder = builder
        .into_inner()
        .map_err(|err| build_err(format!("failed to finish tar stream: {err}")))?;
    let mut file = encoder
        .finish()
        .map_err(|err| build_err(format!("failed to finish gzip stream: {err}")))?;
    file.flush().map_err(|source| DistributorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    file.sync_all().map_err(|source| DistributorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn append_tree<W: Write>(builder: &mut tar::Builder<W>, dir: &Path, prefix: &Path) -> Result<(), String> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|err| format!("failed to read {}: {err}", dir.display()))?
        .collect::<Result<_, _>>()
        .map_err(|err| format!("failed to read {}: {err}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        let path = entry.path();
        let archived = prefix.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|err| format!("failed to stat {}: {err}", path.display()))?;

        if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            builder
                .append_dir(&archived, &path)
                .map_err(|err| format!("failed to add {}: {err}", path.display()))?;
            append_tree(builder, &path, &archived)?;
        } else {
            builder
                .append_path_with_name(&path, &archived)
                .map_err(|err| format!("failed to add {}: {err}", path.display()))?;
        }
    }
    Ok(())
}
