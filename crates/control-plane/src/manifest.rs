//! Role manifest loading and caching.
//!
//! Manifests live at `<infra_base>/<role>/manifest.yml`. A broken or missing
//! manifest never fails the caller: [`ManifestLoader::load`] logs the problem
//! and returns `None`, leaving that role unmanaged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use common::roles::{RoleDefinition, RoleManifest, ServiceEntry, UpdatePolicy};
use tracing::{debug, warn};

use crate::error::ManifestError;
use crate::telemetry;

pub const MANIFEST_FILE: &str = "manifest.yml";
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(5 * 60);

/// Monotonic time source for cache expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + offset
    }
}

/// Lowercase ASCII letters, digits, `-` and `_`, starting with a letter or digit.
pub fn is_valid_role_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

struct CacheEntry {
    manifest: Arc<RoleManifest>,
    loaded_at: Instant,
}

/// Reads, validates and caches role manifests.
///
/// Readers receive an `Arc` so a reload replacing an entry never invalidates
/// a manifest that is already in use.
pub struct ManifestLoader {
    infra_base: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    reported_failures: Mutex<HashSet<String>>,
}

impl ManifestLoader {
    pub fn new(infra_base: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::with_clock(infra_base, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(infra_base: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            infra_base: infra_base.into(),
            ttl,
            clock,
            cache: RwLock::new(HashMap::new()),
            reported_failures: Mutex::new(HashSet::new()),
        }
    }

    pub fn infra_base(&self) -> &Path {
        &self.infra_base
    }

    pub fn manifest_path(&self, role: &str) -> PathBuf {
        self.infra_base.join(role).join(MANIFEST_FILE)
    }

    /// Cached manifest for `role`, or `None` when it is missing or broken.
    pub fn load(&self, role: &str, force_reload: bool) -> Option<Arc<RoleManifest>> {
        match self.try_load(role, force_reload) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                self.report_failure(role, &err);
                None
            }
        }
    }

    /// Like [`load`](Self::load) but returns the reason a manifest is unusable.
    pub fn try_load(&self, role: &str, force_reload: bool) -> Result<Arc<RoleManifest>, ManifestError> {
        if !is_valid_role_name(role) {
            return Err(ManifestError::InvalidName(role.to_string()));
        }

        if !force_reload {
            if let Some(manifest) = self.cached(role) {
                return Ok(manifest);
            }
        }

        match self.read_manifest(role) {
            Ok(manifest) => {
                let manifest = Arc::new(manifest);
                let entry = CacheEntry {
                    manifest: manifest.clone(),
                    loaded_at: self.clock.now(),
                };
                self.cache
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(role.to_string(), entry);
                self.reported_failures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(role);
                telemetry::record_manifest_load("ok");
                debug!(role, "manifest loaded");
                Ok(manifest)
            }
            Err(err) => {
                self.cache
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(role);
                telemetry::record_manifest_load("error");
                Err(err)
            }
        }
    }

    fn cached(&self, role: &str) -> Option<Arc<RoleManifest>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(role)?;
        let age = self.clock.now().saturating_duration_since(entry.loaded_at);
        if age < self.ttl {
            Some(entry.manifest.clone())
        } else {
            None
        }
    }

    fn read_manifest(&self, role: &str) -> Result<RoleManifest, ManifestError> {
        let path = self.manifest_path(role);
        let raw = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ManifestError::NotFound {
                    role: role.to_string(),
                    path: path.clone(),
                }
            } else {
                ManifestError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        parse_manifest(&raw, role, &path)
    }

    fn report_failure(&self, role: &str, err: &ManifestError) {
        let first = self
            .reported_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(role.to_string());
        if first {
            warn!(role, code = err.code(), error = %err, "role manifest unusable; role is unmanaged");
        } else {
            debug!(role, code = err.code(), error = %err, "role manifest still unusable");
        }
    }

    pub fn invalidate(&self, role: &str) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(role);
    }

    pub fn invalidate_all(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Role directories under the infrastructure root that follow the naming
    /// convention and contain a manifest, sorted.
    pub fn role_names(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.infra_base) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.infra_base.display(), %err, "failed to list infrastructure root");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_valid_role_name(name))
            .filter(|name| self.manifest_path(name).is_file())
            .collect();
        names.sort();
        names
    }

    /// Load every role independently; broken manifests are skipped.
    pub fn load_all(&self) -> BTreeMap<String, Arc<RoleManifest>> {
        self.role_names()
            .into_iter()
            .filter_map(|name| self.load(&name, false).map(|m| (name, m)))
            .collect()
    }

    /// Load the given roles, skipping those without a usable manifest.
    pub fn load_many<'a, I>(&self, roles: I) -> HashMap<String, Arc<RoleManifest>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        roles
            .into_iter()
            .filter_map(|name| self.load(name, false).map(|m| (name.clone(), m)))
            .collect()
    }

    pub fn get_health_endpoint(&self, role: &str) -> Option<String> {
        self.load(role, false)
            .and_then(|m| m.health.as_ref().and_then(|h| h.endpoint.clone()))
    }

    pub fn get_port_numbers(&self, role: &str) -> Vec<u16> {
        self.load(role, false)
            .map(|m| m.port_numbers())
            .unwrap_or_default()
    }

    pub fn get_hard_conflicts(&self, role: &str) -> Vec<String> {
        self.load(role, false)
            .map(|m| m.coexistence.hard_conflicts.clone())
            .unwrap_or_default()
    }

    pub fn get_warns_with(&self, role: &str) -> Vec<String> {
        self.load(role, false)
            .map(|m| m.coexistence.warns_with.clone())
            .unwrap_or_default()
    }

    pub fn get_update_policy(&self, role: &str) -> Option<UpdatePolicy> {
        self.load(role, false).map(|m| m.update_policy())
    }

    pub fn get_service_order(&self, role: &str) -> Vec<ServiceEntry> {
        self.load(role, false)
            .map(|m| m.service_order())
            .unwrap_or_default()
    }

    pub fn get_tls_rotate_days_before(&self, role: &str) -> Option<u32> {
        self.load(role, false).map(|m| m.tls_rotate_days_before())
    }

    pub fn get_role_definition(&self, role: &str) -> Option<RoleDefinition> {
        self.load(role, false).map(|m| m.to_definition())
    }
}

/// Parse and validate manifest YAML for the role stored in `directory`.
pub fn parse_manifest(raw: &str, directory: &str, path: &Path) -> Result<RoleManifest, ManifestError> {
    let mut manifest: RoleManifest = if raw.trim().is_empty() {
        RoleManifest::default()
    } else {
        serde_yaml::from_str(raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };

    let declared = manifest.name.trim().to_string();
    if declared.is_empty() {
        manifest.name = directory.to_string();
    } else if declared != directory {
        return Err(ManifestError::NameMismatch {
            path: path.to_path_buf(),
            declared,
            directory: directory.to_string(),
        });
    } else {
        manifest.name = declared;
    }

    let invalid = |reason: String| ManifestError::Invalid {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(port) = manifest.ports.iter().find(|p| p.port() == 0) {
        return Err(invalid(format!("port {} is out of range", port.port())));
    }
    if manifest.health.as_ref().and_then(|h| h.port) == Some(0) {
        return Err(invalid("health.port must be > 0".to_string()));
    }
    if manifest.services.iter().any(|s| s.name.trim().is_empty()) {
        return Err(invalid("service names cannot be empty".to_string()));
    }
    if manifest.coexistence.hard_conflicts.iter().any(|r| r == directory) {
        return Err(invalid("a role cannot hard-conflict with itself".to_string()));
    }
    if let Some(tls) = &manifest.tls {
        if tls.rotate_days_before == Some(0) {
            return Err(invalid("tls.rotate_days_before must be > 0".to_string()));
        }
    }
    Ok(manifest)
}
