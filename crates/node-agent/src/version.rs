//! `version.json` handling.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use common::roles::AgentVersion;
use serde::Deserialize;
use tracing::debug;

pub const VERSION_FILE_NAME: &str = "version.json";

#[derive(Deserialize)]
struct CommitOnly {
    commit: String,
}

/// Commit recorded in a `version.json`, if the file exists and parses.
pub fn read_commit(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<CommitOnly>(&raw) {
        Ok(v) if !v.commit.trim().is_empty() => Some(v.commit.trim().to_string()),
        Ok(_) => None,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "ignoring unreadable version file");
            None
        }
    }
}

/// Candidate version files for a role: beside the target, in its parent, then
/// the global file.
pub fn version_candidates(target_path: &str, global: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if !target_path.trim().is_empty() {
        let target = Path::new(target_path);
        candidates.push(target.join(VERSION_FILE_NAME));
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            candidates.push(parent.join(VERSION_FILE_NAME));
        }
    }
    candidates.push(global.to_path_buf());
    candidates
}

pub fn lookup_role_version(target_path: &str, global: &Path) -> Option<String> {
    version_candidates(target_path, global)
        .iter()
        .find_map(|path| read_commit(path))
}

pub fn read_agent_version(path: &Path) -> anyhow::Result<Option<AgentVersion>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(anyhow::anyhow!("failed to read {}: {err}", path.display())),
    };
    let version = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("invalid version file {}: {err}", path.display()))?;
    Ok(Some(version))
}

/// Write through a temporary sibling and rename, so readers never see a
/// partial file.
pub fn write_agent_version(path: &Path, version: &AgentVersion) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(version).map_err(std::io::Error::other)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
