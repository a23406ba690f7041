use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::roles::RoleDefinition;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionsError {
    #[error("failed to read role definitions {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse role definitions {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("role definitions {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionsFile {
    List(Vec<RoleDefinition>),
    Wrapped { roles: Vec<RoleDefinition> },
}

/// Read the node's role definitions. The file is either a list or a map with
/// a `roles` list; JSON parses as YAML.
pub fn load_role_definitions(path: &Path) -> Result<Vec<RoleDefinition>, DefinitionsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| DefinitionsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_role_definitions(&raw, path)
}

pub fn parse_role_definitions(raw: &str, path: &Path) -> Result<Vec<RoleDefinition>, DefinitionsError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: DefinitionsFile = serde_yaml::from_str(raw).map_err(|source| DefinitionsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let definitions = match parsed {
        DefinitionsFile::List(list) => list,
        DefinitionsFile::Wrapped { roles } => roles,
    };

    let mut seen = HashSet::new();
    for def in &definitions {
        if def.name.trim().is_empty() {
            return Err(DefinitionsError::Invalid {
                path: path.to_path_buf(),
                reason: "role name cannot be empty".into(),
            });
        }
        if !seen.insert(def.name.as_str()) {
            return Err(DefinitionsError::Invalid {
                path: path.to_path_buf(),
                reason: format!("role '{}' is defined twice", def.name),
            });
        }
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Vec<RoleDefinition>, DefinitionsError> {
        parse_role_definitions(raw, Path::new("/etc/rolefleet/roles.yml"))
    }

    #[test]
    fn accepts_plain_list() {
        let defs = parse(
            "- name: web\n  target_path: /srv/web\n  systemd_service: nginx\n  health_check_port: 80\n- name: cron-jobs\n",
        )
        .expect("parse");
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].systemd_service.as_deref(), Some("nginx"));
        assert_eq!(defs[1].target_path, "");
    }

    #[test]
    fn accepts_wrapped_json() {
        let defs = parse(r#"{"roles":[{"name":"db","systemd_service":"postgresql"}]}"#).expect("parse");
        assert_eq!(defs[0].name, "db");
    }

    #[test]
    fn empty_file_means_no_roles() {
        assert!(parse("\n").expect("parse").is_empty());
    }

    #[test]
    fn rejects_duplicates() {
        let err = parse("- name: web\n- name: web\n").expect_err("duplicate");
        assert!(err.to_string().contains("defined twice"));
    }
}
