use std::path::PathBuf;

use axum::http::StatusCode;
use common::checksum::ChecksumError;
use common::command::CommandError;

/// Why a role manifest could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("role name '{0}' does not follow the role naming convention")]
    InvalidName(String),
    #[error("manifest for role '{role}' not found at {path}")]
    NotFound { role: String, path: PathBuf },
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("manifest {path} declares name '{declared}' but lives in directory '{directory}'")]
    NameMismatch {
        path: PathBuf,
        declared: String,
        directory: String,
    },
    #[error("manifest {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl ManifestError {
    pub fn code(&self) -> &'static str {
        match self {
            ManifestError::InvalidName(_) => "manifest_invalid_name",
            ManifestError::NotFound { .. } => "manifest_not_found",
            ManifestError::Io { .. } => "manifest_io",
            ManifestError::Parse { .. } => "manifest_parse",
            ManifestError::NameMismatch { .. } => "manifest_name_mismatch",
            ManifestError::Invalid { .. } => "manifest_invalid",
        }
    }
}

/// Failures while building, verifying or shipping code packages.
#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("invalid commit hash '{0}'")]
    InvalidCommit(String),
    #[error("failed to resolve repository HEAD: {0}")]
    ResolveHead(String),
    #[error("agent source directory {0} does not exist")]
    MissingSource(PathBuf),
    #[error("package io error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build package for {commit}: {message}")]
    Build { commit: String, message: String },
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("package {path} failed integrity check: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("failed to upload {path} to {destination}: {message}")]
    Upload {
        path: PathBuf,
        destination: String,
        message: String,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("background task failed: {0}")]
    Join(String),
}

impl DistributorError {
    pub fn code(&self) -> &'static str {
        match self {
            DistributorError::InvalidCommit(_) => "invalid_commit",
            DistributorError::ResolveHead(_) => "resolve_head_failed",
            DistributorError::MissingSource(_) => "missing_agent_source",
            DistributorError::Io { .. } => "package_io",
            DistributorError::Build { .. } => "package_build_failed",
            DistributorError::Checksum(_) => "package_checksum",
            DistributorError::Integrity { .. } => "package_integrity",
            DistributorError::Upload { .. } => "package_upload_failed",
            DistributorError::Command(err) => err.code(),
            DistributorError::Join(_) => "internal_error",
        }
    }
}

/// Fleet state store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("failed to read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse inventory {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid node record: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NodeNotFound(_) => "node_not_found",
            StoreError::Io { .. } => "inventory_io",
            StoreError::Parse { .. } => "inventory_parse",
            StoreError::Invalid(_) => "invalid_node",
        }
    }
}

/// Service discovery failures. A service with only unhealthy instances is
/// not an error.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("service '{0}' has no discoverable instances")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DiscoveryError {
    pub fn code(&self) -> &'static str {
        match self {
            DiscoveryError::NotFound(_) => "service_not_found",
            DiscoveryError::Store(err) => err.code(),
        }
    }
}

/// Failures while pulling a node report from an agent.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("agent on {destination} exited with {status}: {output}")]
    RemoteExit {
        destination: String,
        status: String,
        output: String,
    },
    #[error("agent on {destination} returned an unreadable report: {source}")]
    Decode {
        destination: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CollectError {
    pub fn code(&self) -> &'static str {
        match self {
            CollectError::Command(err) => err.code(),
            CollectError::RemoteExit { .. } => "collect_remote_exit",
            CollectError::Decode { .. } => "collect_decode",
            CollectError::Store(err) => err.code(),
        }
    }
}

/// Status, stable code and message for an API layer to marshal.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status.as_u16(), self.message)
    }
}

impl std::error::Error for AppError {}

impl From<ManifestError> for AppError {
    fn from(err: ManifestError) -> Self {
        let status = match err {
            ManifestError::NotFound { .. } => StatusCode::NOT_FOUND,
            ManifestError::InvalidName(_) => StatusCode::BAD_REQUEST,
            ManifestError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

impl From<DiscoveryError> for AppError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::NotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, err.code(), err.to_string())
            }
            DiscoveryError::Store(inner) => inner.into(),
        }
    }
}

impl From<DistributorError> for AppError {
    fn from(err: DistributorError) -> Self {
        let status = match &err {
            DistributorError::InvalidCommit(_) => StatusCode::BAD_REQUEST,
            DistributorError::Integrity { .. } | DistributorError::Checksum(_) => {
                StatusCode::CONFLICT
            }
            DistributorError::Upload { .. } => StatusCode::BAD_GATEWAY,
            DistributorError::Command(inner) if inner.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

impl From<CollectError> for AppError {
    fn from(err: CollectError) -> Self {
        let status = match &err {
            CollectError::Command(inner) if inner.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            CollectError::Store(StoreError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn discovery_not_found_maps_to_404() {
        let err: AppError = DiscoveryError::NotFound("cache".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "service_not_found");
        assert!(err.message.contains("cache"));
    }

    #[test]
    fn integrity_errors_map_to_conflict() {
        let err: AppError = DistributorError::Integrity {
            path: PathBuf::from("/tmp/agent.tar.gz"),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "package_integrity");
    }

    #[test]
    fn command_timeouts_map_to_gateway_timeout() {
        let err: AppError = DistributorError::Command(CommandError::TimedOut {
            command: "ssh".into(),
            timeout: Duration::from_secs(5),
        })
        .into();
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code, "command_timed_out");
    }

    #[test]
    fn manifest_errors_keep_distinct_codes() {
        let err: AppError = ManifestError::NameMismatch {
            path: PathBuf::from("/srv/infra/web/manifest.yml"),
            declared: "api".into(),
            directory: "web".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code, "manifest_name_mismatch");

        let store: AppError = StoreError::NodeNotFound("n1".into()).into();
        assert_eq!(store.status, StatusCode::NOT_FOUND);
        assert_eq!(format!("{store}"), "node_not_found (404): node 'n1' not found");
    }
}
