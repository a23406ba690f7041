use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::roles::{AgentVersion, RoleDefinition, RoleState, RoleStatus};

/// File name of the package staged on a node for `sync` to activate. The
/// checksum sits beside it with a `.sha256` suffix.
pub const STAGED_PACKAGE_FILE: &str = "agent-package.tar.gz";

/// A service instance as reported by a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    /// Logical service name used for discovery.
    pub name: String,
    /// Port the instance listens on.
    pub port: u16,
    /// Protocol spoken on the port.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Endpoint path for HTTP-style services.
    #[serde(default)]
    pub endpoint_path: Option<String>,
    /// Health as observed by the agent.
    #[serde(default)]
    pub healthy: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Everything one agent reported in one detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// When the agent produced the report.
    pub reported_at: DateTime<Utc>,
    /// Detected status per role.
    #[serde(default)]
    pub roles: HashMap<String, RoleStatus>,
    /// Service instances the node exposes.
    #[serde(default)]
    pub services: Vec<ServiceReport>,
    /// Code version the agent runs.
    #[serde(default)]
    pub agent_version: Option<AgentVersion>,
}

impl NodeReport {
    /// Empty report stamped with `reported_at`.
    pub fn new(reported_at: DateTime<Utc>) -> Self {
        Self {
            reported_at,
            roles: HashMap::new(),
            services: Vec::new(),
            agent_version: None,
        }
    }

    /// Derive service reports from detected roles: one entry per declared
    /// health port of every installed role. An instance is healthy only when
    /// its role is active and the port was seen listening; stopped instances
    /// are still reported so discovery can show them as unhealthy.
    pub fn services_from_roles(
        definitions: &[RoleDefinition],
        roles: &HashMap<String, RoleStatus>,
    ) -> Vec<ServiceReport> {
        let mut services: Vec<ServiceReport> = definitions
            .iter()
            .filter_map(|def| {
                let port = def.health_check_port?;
                let status = roles.get(&def.name)?;
                if status.status == RoleState::NotInstalled {
                    return None;
                }
                Some(ServiceReport {
                    name: def.name.clone(),
                    port,
                    protocol: def.protocol.clone().unwrap_or_else(default_protocol),
                    endpoint_path: def.endpoint_path.clone(),
                    healthy: status.status == RoleState::Active && status.ports.contains(&port),
                })
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.port.cmp(&b.port)));
        services
    }
}

/// One discoverable instance of a service, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiscoveryRecord {
    /// Logical service name.
    pub service_name: String,
    /// Node hosting the instance.
    pub node_id: String,
    /// Address clients should connect to.
    pub host: String,
    /// Port clients should connect to.
    pub port: u16,
    /// Protocol spoken on the port.
    pub protocol: String,
    /// Endpoint path, if any.
    pub endpoint_path: Option<String>,
    /// Whether the instance is currently considered healthy.
    pub healthy: bool,
}
