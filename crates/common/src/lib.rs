//! Shared schema and helpers for the rolefleet workspace.
//!
//! The control plane and the node agent both depend on this crate so that role
//! manifests, role definitions and reported role status have exactly one
//! definition across the fleet.

#![warn(missing_docs)]

/// SHA-256 helpers for code packages.
pub mod checksum;
/// Bounded-timeout subprocess runner shared by local and remote commands.
pub mod command;
/// Node reports and service discovery records.
pub mod fleet;
/// Role manifests, role definitions and detected role status.
pub mod roles;
