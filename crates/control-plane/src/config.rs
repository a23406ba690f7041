use std::path::{Path, PathBuf};
use std::time::Duration;

use common::roles::SyncStrategy;
use serde::{Deserialize, Deserializer};

use crate::distributor::ssh::SshHostKeyChecking;

pub const ENV_PREFIX: &str = "ROLEFLEET_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Root directory holding one `<role>/manifest.yml` per role.
    pub infra_base: PathBuf,
    pub manifest_ttl_secs: u64,
    /// YAML inventory seeding the fleet store.
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,
    pub packages: PackagesConfig,
    pub ssh: SshConfig,
    pub rollout: RolloutConfig,
    pub reconcile: ReconcileConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackagesConfig {
    /// Where built tarballs and their `.sha256` files are kept.
    pub dir: PathBuf,
    /// Agent source tree packaged under `agent/`.
    pub agent_source_dir: PathBuf,
    /// Repository used to resolve HEAD when no commit is given.
    pub repo_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub program: String,
    pub connect_timeout_secs: u16,
    #[serde(deserialize_with = "deserialize_host_key_checking")]
    pub host_key_checking: SshHostKeyChecking,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Upper bound for one remote sync invocation.
    pub command_timeout_secs: u64,
    /// Upper bound for one package upload.
    pub upload_timeout_secs: u64,
    /// Agent binary invoked on the node (`<agent_binary> sync ...`).
    pub agent_binary: String,
    /// Remote directory receiving staged packages.
    pub staging_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolloutConfig {
    pub concurrency: usize,
    pub restart: bool,
    #[serde(deserialize_with = "deserialize_strategy")]
    pub strategy: SyncStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Reports older than this mark the node's services unhealthy.
    pub stale_after_secs: u64,
    /// Pull fresh reports from agents over SSH before each sweep.
    pub collect_reports: bool,
    pub collect_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

fn deserialize_strategy<'de, D>(deserializer: D) -> Result<SyncStrategy, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn deserialize_host_key_checking<'de, D>(deserializer: D) -> Result<SshHostKeyChecking, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl AppConfig {
    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_ttl_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.infra_base.as_os_str().is_empty() {
            anyhow::bail!("infra_base cannot be empty");
        }
        self.ssh.validate()?;
        self.rollout.validate()?;
        self.reconcile.validate()?;
        if self.metrics.host.trim().is_empty() {
            anyhow::bail!("metrics.host cannot be empty");
        }
        Ok(())
    }
}

impl SshConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.program.trim().is_empty() {
            anyhow::bail!("ssh.program cannot be empty");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("ssh.connect_timeout_secs must be > 0");
        }
        if self.command_timeout_secs == 0 {
            anyhow::bail!("ssh.command_timeout_secs must be > 0");
        }
        if self.upload_timeout_secs == 0 {
            anyhow::bail!("ssh.upload_timeout_secs must be > 0");
        }
        if self.agent_binary.trim().is_empty() {
            anyhow::bail!("ssh.agent_binary cannot be empty");
        }
        if !self.staging_dir.starts_with('/') {
            anyhow::bail!("ssh.staging_dir must be an absolute path");
        }
        Ok(())
    }
}

impl RolloutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("rollout.concurrency must be > 0");
        }
        Ok(())
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_secs == 0 {
            anyhow::bail!("reconcile.interval_secs must be > 0");
        }
        if self.stale_after_secs == 0 {
            anyhow::bail!("reconcile.stale_after_secs must be > 0");
        }
        if self.collect_concurrency == 0 {
            anyhow::bail!("reconcile.collect_concurrency must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    load_from(None)
}

/// Load configuration from an optional file plus `ROLEFLEET_CP__*` variables.
///
/// Without an explicit path, a `config.{toml,yaml,json}` in the working
/// directory is used when present.
pub fn load_from(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so commit-like values stay strings.
        .try_parsing(false);

    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name("config").required(false),
    };

    let builder = config::Config::builder()
        .add_source(file)
        .add_source(env)
        .set_default("infra_base", "/srv/infra")?
        .set_default("manifest_ttl_secs", 300u64)?
        .set_default("inventory_path", Option::<String>::None)?
        .set_default("packages.dir", "/var/lib/rolefleet/packages")?
        .set_default("packages.agent_source_dir", "agent")?
        .set_default("packages.repo_dir", ".")?
        .set_default("ssh.program", "ssh")?
        .set_default("ssh.connect_timeout_secs", 10)?
        .set_default("ssh.host_key_checking", "strict")?
        .set_default("ssh.identity_file", Option::<String>::None)?
        .set_default("ssh.command_timeout_secs", 120u64)?
        .set_default("ssh.upload_timeout_secs", 300u64)?
        .set_default("ssh.agent_binary", "rolefleet-agent")?
        .set_default("ssh.staging_dir", "/var/lib/rolefleet/staging")?
        .set_default("rollout.concurrency", 8)?
        .set_default("rollout.restart", true)?
        .set_default("rollout.strategy", "graceful")?
        .set_default("reconcile.interval_secs", 60u64)?
        .set_default("reconcile.stale_after_secs", 180u64)?
        .set_default("reconcile.collect_reports", true)?
        .set_default("reconcile.collect_concurrency", 8)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9464)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.ssh.agent_binary = app.ssh.agent_binary.trim().to_string();
    app.ssh.staging_dir = app.ssh.staging_dir.trim_end_matches('/').to_string();
    app.metrics.host = app.metrics.host.trim().to_string();
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_control_plane_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        for (key, _) in &existing {
            env::remove_var(key);
        }

        for (key, value) in vars {
            env::set_var(key, value);
        }

        let result = panic::catch_unwind(test);

        for (key, _) in vars {
            env::remove_var(key);
        }

        for (key, value) in existing {
            env::set_var(key, value);
        }

        result.unwrap();
    }

    #[test]
    fn defaults_load_and_validate() {
        with_control_plane_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.manifest_ttl(), Duration::from_secs(300));
            assert_eq!(cfg.ssh.command_timeout(), Duration::from_secs(120));
            assert_eq!(cfg.ssh.host_key_checking, SshHostKeyChecking::Strict);
            assert_eq!(cfg.rollout.strategy, SyncStrategy::Graceful);
            assert!(cfg.rollout.restart);
            assert!(cfg.reconcile.collect_reports);
            assert!(cfg.inventory_path.is_none());
        });
    }

    #[test]
    fn numeric_bool_and_enum_env_values_parse() {
        with_control_plane_env(
            &[
                ("ROLEFLEET_CP__MANIFEST_TTL_SECS", "60"),
                ("ROLEFLEET_CP__ROLLOUT__CONCURRENCY", "3"),
                ("ROLEFLEET_CP__ROLLOUT__RESTART", "false"),
                ("ROLEFLEET_CP__ROLLOUT__STRATEGY", "immediate"),
                ("ROLEFLEET_CP__SSH__HOST_KEY_CHECKING", "accept-new"),
                ("ROLEFLEET_CP__INVENTORY_PATH", "/etc/rolefleet/nodes.yml"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.manifest_ttl_secs, 60);
                assert_eq!(cfg.rollout.concurrency, 3);
                assert!(!cfg.rollout.restart);
                assert_eq!(cfg.rollout.strategy, SyncStrategy::Immediate);
                assert_eq!(cfg.ssh.host_key_checking, SshHostKeyChecking::AcceptNew);
                assert_eq!(
                    cfg.inventory_path.as_deref(),
                    Some(Path::new("/etc/rolefleet/nodes.yml"))
                );
            },
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        with_control_plane_env(&[("ROLEFLEET_CP__ROLLOUT__CONCURRENCY", "0")], || {
            let err = load().expect_err("zero concurrency rejected");
            assert!(err.to_string().contains("rollout.concurrency"), "{err}");
        });
        with_control_plane_env(&[("ROLEFLEET_CP__ROLLOUT__STRATEGY", "later")], || {
            let err = load().expect_err("unknown strategy rejected");
            assert!(format!("{err:#}").contains("later"), "{err:#}");
        });
        with_control_plane_env(&[("ROLEFLEET_CP__SSH__STAGING_DIR", "relative/dir")], || {
            let err = load().expect_err("relative staging dir rejected");
            assert!(err.to_string().contains("staging_dir"), "{err}");
        });
    }

    #[test]
    fn explicit_file_is_required_and_read() {
        with_control_plane_env(&[], || {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("rolefleet.yaml");
            std::fs::write(
                &path,
                "infra_base: /opt/infra\nreconcile:\n  stale_after_secs: 30\n",
            )
            .expect("write config");

            let cfg = load_from(Some(&path)).expect("config loads");
            assert_eq!(cfg.infra_base, PathBuf::from("/opt/infra"));
            assert_eq!(cfg.reconcile.stale_after(), Duration::from_secs(30));

            let missing = dir.path().join("missing.yaml");
            assert!(load_from(Some(&missing)).is_err());
        });
    }
}
