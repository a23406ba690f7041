use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default TLS rotation lead time when a manifest does not declare one.
pub const DEFAULT_TLS_ROTATE_DAYS_BEFORE: u32 = 14;

/// Automatic update scope allowed for a role (wire format uses lowercase values).
///
/// Variants are ordered from most to least permissive so that `max` yields the
/// strictest policy of a set.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Any package update may be applied automatically.
    #[default]
    Full,
    /// Only security updates may be applied automatically.
    Security,
    /// No automatic updates; an operator applies updates by hand.
    Manual,
}

impl UpdatePolicy {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePolicy::Full => "full",
            UpdatePolicy::Security => "security",
            UpdatePolicy::Manual => "manual",
        }
    }

    /// Returns the more restrictive of the two policies.
    pub fn strictest(self, other: UpdatePolicy) -> UpdatePolicy {
        self.max(other)
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional health endpoint declared by a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Full URL of the health endpoint, if the role exposes one.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Port the health endpoint listens on.
    #[serde(default)]
    pub port: Option<u16>,
}

/// A port declared by a manifest, either as a bare number or as a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortDecl {
    /// Bare port number; protocol defaults to TCP.
    Number(u16),
    /// Port with explicit protocol and optional endpoint path.
    Detailed {
        /// Port number.
        port: u16,
        /// Transport or application protocol (e.g. `tcp`, `http`).
        #[serde(default = "default_protocol")]
        protocol: String,
        /// Endpoint path for HTTP-style services.
        #[serde(default)]
        path: Option<String>,
    },
}

impl PortDecl {
    /// Port number regardless of declaration style.
    pub fn port(&self) -> u16 {
        match self {
            PortDecl::Number(port) => *port,
            PortDecl::Detailed { port, .. } => *port,
        }
    }

    /// Declared protocol, `tcp` for bare numbers.
    pub fn protocol(&self) -> &str {
        match self {
            PortDecl::Number(_) => "tcp",
            PortDecl::Detailed { protocol, .. } => protocol,
        }
    }

    /// Declared endpoint path, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            PortDecl::Number(_) => None,
            PortDecl::Detailed { path, .. } => path.as_deref(),
        }
    }
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// A service unit belonging to a role, with its start position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service (systemd unit) name.
    pub name: String,
    /// Lower values start first.
    #[serde(default)]
    pub start_order: i32,
}

/// Coexistence rules against other roles on the same node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coexistence {
    /// Roles that must never share a node with this one.
    #[serde(default)]
    pub hard_conflicts: Vec<String>,
    /// Roles that may share a node but are flagged as risky.
    #[serde(default)]
    pub warns_with: Vec<String>,
}

/// Operating-system update settings for a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemUpdates {
    /// Allowed automatic update scope.
    #[serde(default)]
    pub policy: UpdatePolicy,
}

/// TLS certificate rotation preference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Whether certificates for this role rotate automatically.
    #[serde(default)]
    pub auto_rotate: bool,
    /// Days before expiry at which rotation should happen.
    #[serde(default)]
    pub rotate_days_before: Option<u32>,
}

impl TlsSettings {
    /// Rotation lead time, falling back to [`DEFAULT_TLS_ROTATE_DAYS_BEFORE`].
    pub fn effective_rotate_days_before(&self) -> u32 {
        self.rotate_days_before
            .unwrap_or(DEFAULT_TLS_ROTATE_DAYS_BEFORE)
    }
}

/// Where a role lives on a node, used to derive the agent-side definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    /// Filesystem path of the role's code or data; empty for service-only roles.
    #[serde(default)]
    pub target_path: String,
    /// Main systemd unit, if the role runs one.
    #[serde(default)]
    pub systemd_service: Option<String>,
}

/// Declared contract of one role, loaded from `<infra_base>/<role>/manifest.yml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleManifest {
    /// Role name; matches the directory the manifest was loaded from.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Manifest or role version label.
    #[serde(default)]
    pub version: Option<String>,
    /// Health endpoint declaration.
    #[serde(default)]
    pub health: Option<HealthCheck>,
    /// Ports the role listens on.
    #[serde(default)]
    pub ports: Vec<PortDecl>,
    /// Service units with start order.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    /// Coexistence rules.
    #[serde(default)]
    pub coexistence: Coexistence,
    /// System update policy.
    #[serde(default)]
    pub system_updates: SystemUpdates,
    /// TLS rotation preference.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    /// Installation layout on the node.
    #[serde(default)]
    pub install: Option<InstallSpec>,
}

impl RoleManifest {
    /// Declared port numbers in declaration order.
    pub fn port_numbers(&self) -> Vec<u16> {
        self.ports.iter().map(PortDecl::port).collect()
    }

    /// Services sorted by start order, ties broken by name.
    pub fn service_order(&self) -> Vec<ServiceEntry> {
        let mut services = self.services.clone();
        services.sort_by(|a, b| {
            a.start_order
                .cmp(&b.start_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        services
    }

    /// Declared update policy.
    pub fn update_policy(&self) -> UpdatePolicy {
        self.system_updates.policy
    }

    /// TLS rotation lead time in days (defaults to 14 when unset).
    pub fn tls_rotate_days_before(&self) -> u32 {
        self.tls
            .as_ref()
            .map(TlsSettings::effective_rotate_days_before)
            .unwrap_or(DEFAULT_TLS_ROTATE_DAYS_BEFORE)
    }

    /// Rotation lead time, only when the role opts into automatic rotation.
    pub fn tls_auto_rotate_days(&self) -> Option<u32> {
        self.tls
            .as_ref()
            .filter(|tls| tls.auto_rotate)
            .map(TlsSettings::effective_rotate_days_before)
    }

    /// Derive the lighter agent-side definition.
    ///
    /// The service comes from `install.systemd_service`, falling back to the
    /// first service in start order. The health-check port comes from
    /// `health.port`, falling back to the first declared port.
    pub fn to_definition(&self) -> RoleDefinition {
        let install = self.install.clone().unwrap_or_default();
        let systemd_service = install
            .systemd_service
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.service_order().into_iter().next().map(|s| s.name));
        let health_check_port = self
            .health
            .as_ref()
            .and_then(|h| h.port)
            .or_else(|| self.ports.first().map(PortDecl::port));
        let declared = health_check_port
            .and_then(|port| self.ports.iter().find(|decl| decl.port() == port));
        let protocol = declared.map(|decl| decl.protocol().to_string());
        let endpoint_path = declared
            .and_then(|decl| decl.path().map(str::to_string))
            .or_else(|| {
                self.health
                    .as_ref()
                    .and_then(|h| h.endpoint.as_deref())
                    .and_then(health_endpoint_path)
            });

        RoleDefinition {
            name: self.name.clone(),
            target_path: install.target_path,
            systemd_service,
            health_check_port,
            protocol,
            endpoint_path,
        }
    }
}

/// Path component of a health endpoint, accepting either a bare path or a
/// full URL such as `http://127.0.0.1:8080/healthz`.
fn health_endpoint_path(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with('/') {
        return Some(endpoint.to_string());
    }
    let rest = endpoint.split_once("://").map_or(endpoint, |(_, rest)| rest);
    rest.find('/').map(|idx| rest[idx..].to_string())
}

/// Agent-side description of a role, decoupled from the full manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Role name.
    pub name: String,
    /// Path whose existence means the role is installed; empty for service-only roles.
    #[serde(default)]
    pub target_path: String,
    /// systemd unit backing the role.
    #[serde(default)]
    pub systemd_service: Option<String>,
    /// Port expected to be listening when the role is healthy.
    #[serde(default)]
    pub health_check_port: Option<u16>,
    /// Protocol spoken on the health-check port; `tcp` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// HTTP path clients should hit, if the role declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_path: Option<String>,
}

/// Derived installation state of a role on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleState {
    /// Declared path is absent.
    NotInstalled,
    /// Installed, but its service is not running.
    Inactive,
    /// Installed and running (or installed with no service).
    Active,
}

impl RoleState {
    /// Derive the state from the individual checks.
    pub fn derive(path_exists: bool, has_service: bool, service_running: bool) -> RoleState {
        if !path_exists {
            return RoleState::NotInstalled;
        }
        if !has_service || service_running {
            RoleState::Active
        } else {
            RoleState::Inactive
        }
    }

    /// Returns the canonical snake_case representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleState::NotInstalled => "not_installed",
            RoleState::Inactive => "inactive",
            RoleState::Active => "active",
        }
    }
}

/// Result of one detection pass for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStatus {
    /// Whether the declared path exists (always true for service-only roles).
    pub path_exists: bool,
    /// Resolved path that was checked, if any.
    pub path: Option<String>,
    /// Whether the role's service reported active.
    pub service_running: bool,
    /// Normalized service unit name, if the role has one.
    pub service_name: Option<String>,
    /// Declared health-check ports that were actually listening.
    pub ports: Vec<u16>,
    /// Commit hash read from the role's version file.
    pub version: Option<String>,
    /// Derived state.
    pub status: RoleState,
}

/// Persisted record of which code a node runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentVersion {
    /// Commit hash of the installed code.
    pub commit: String,
    /// When the package was built.
    pub built_at: DateTime<Utc>,
    /// When the package was activated on this node. Absent inside packages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// How the agent should restart after a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Restart the service right away.
    Immediate,
    /// Reload if supported, otherwise restart.
    #[default]
    Graceful,
    /// Leave the restart to an operator.
    Manual,
}

impl SyncStrategy {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Immediate => "immediate",
            SyncStrategy::Graceful => "graceful",
            SyncStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(SyncStrategy::Immediate),
            "graceful" => Ok(SyncStrategy::Graceful),
            "manual" => Ok(SyncStrategy::Manual),
            other => Err(format!(
                "unknown sync strategy '{other}'; expected immediate, graceful or manual"
            )),
        }
    }
}
