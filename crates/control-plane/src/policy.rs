//! Node-wide conflict and update policy resolution.
//!
//! Everything here is pure over already-loaded manifests.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use common::roles::{RoleManifest, UpdatePolicy};
use serde::Serialize;

use crate::manifest::ManifestLoader;

/// Two roles involved in a coexistence rule, stored in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RolePair {
    pub first: String,
    pub second: String,
}

impl RolePair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                first: a.to_string(),
                second: b.to_string(),
            }
        } else {
            Self {
                first: b.to_string(),
                second: a.to_string(),
            }
        }
    }
}

impl fmt::Display for RolePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.first, self.second)
    }
}

/// Resolved policy for one node's role set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodePolicy {
    /// Assigned roles, deduplicated and sorted.
    pub roles: Vec<String>,
    /// Blocking conflicts; any entry prevents activation on the node.
    pub hard_conflicts: Vec<RolePair>,
    /// Advisory coexistence warnings.
    pub soft_warnings: Vec<RolePair>,
    pub update_policy: UpdatePolicy,
    /// Smallest rotation lead time among roles with automatic TLS rotation.
    pub tls_rotate_days_before: Option<u32>,
    /// Assigned roles without a usable manifest.
    pub unmanaged_roles: Vec<String>,
}

impl NodePolicy {
    pub fn is_blocked(&self) -> bool {
        !self.hard_conflicts.is_empty()
    }
}

/// Resolve the policy for `assigned` given the manifests that could be loaded.
/// Roles missing from `manifests` are reported as unmanaged.
pub fn resolve(assigned: &[String], manifests: &HashMap<String, Arc<RoleManifest>>) -> NodePolicy {
    let roles: BTreeSet<&str> = assigned.iter().map(String::as_str).collect();

    let mut hard = BTreeSet::new();
    let mut soft = BTreeSet::new();
    let mut update_policy = UpdatePolicy::default();
    let mut tls_rotate_days_before: Option<u32> = None;
    let mut unmanaged = Vec::new();

    for role in &roles {
        let Some(manifest) = manifests.get(*role) else {
            unmanaged.push(role.to_string());
            continue;
        };

        for other in &manifest.coexistence.hard_conflicts {
            if other.as_str() != *role && roles.contains(other.as_str()) {
                hard.insert(RolePair::new(role, other));
            }
        }
        for other in &manifest.coexistence.warns_with {
            if other.as_str() != *role && roles.contains(other.as_str()) {
                soft.insert(RolePair::new(role, other));
            }
        }

        update_policy = update_policy.strictest(manifest.update_policy());

        if let Some(days) = manifest.tls_auto_rotate_days() {
            tls_rotate_days_before = Some(match tls_rotate_days_before {
                Some(current) => current.min(days),
                None => days,
            });
        }
    }

    // A pair that is already blocking is not repeated as a warning.
    let soft_warnings = soft.difference(&hard).cloned().collect();

    NodePolicy {
        roles: roles.iter().map(|r| r.to_string()).collect(),
        hard_conflicts: hard.into_iter().collect(),
        soft_warnings,
        update_policy,
        tls_rotate_days_before,
        unmanaged_roles: unmanaged,
    }
}

/// Load the manifests for `assigned` through `loader` and resolve.
pub fn resolve_with_loader(assigned: &[String], loader: &ManifestLoader) -> NodePolicy {
    let manifests = loader.load_many(assigned);
    resolve(assigned, &manifests)
}
