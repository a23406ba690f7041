use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "ROLEFLEET_AGENT";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Role definitions for this node (YAML or JSON).
    pub roles_file: PathBuf,
    pub detect_interval_secs: u64,
    /// Upper bound for one service-manager query.
    pub service_timeout_secs: u64,
    /// Last-resort `version.json` consulted during detection.
    pub global_version_file: PathBuf,
    /// Where `sync` records the activated agent version.
    pub version_file: PathBuf,
    /// Holds `releases/<commit>` and the `current` symlink.
    pub install_dir: PathBuf,
    /// Where the control plane stages packages.
    pub staging_dir: PathBuf,
    /// systemd unit restarted after a sync.
    pub agent_unit: String,
    pub systemctl: String,
    /// Upper bound for restart commands issued by `sync`.
    pub command_timeout_secs: u64,
    /// When set, `run` writes each report here as JSON.
    #[serde(default)]
    pub report_file: Option<PathBuf>,
    pub metrics_host: String,
    pub metrics_port: u16,
}

impl AppConfig {
    pub fn detect_interval(&self) -> Duration {
        Duration::from_secs(self.detect_interval_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.detect_interval_secs == 0 {
            anyhow::bail!("detect_interval_secs must be > 0");
        }
        if self.service_timeout_secs == 0 {
            anyhow::bail!("service_timeout_secs must be > 0");
        }
        if self.command_timeout_secs == 0 {
            anyhow::bail!("command_timeout_secs must be > 0");
        }
        if self.install_dir.as_os_str().is_empty() {
            anyhow::bail!("install_dir cannot be empty");
        }
        if self.agent_unit.trim().is_empty() {
            anyhow::bail!("agent_unit cannot be empty");
        }
        if self.systemctl.trim().is_empty() {
            anyhow::bail!("systemctl cannot be empty");
        }
        Ok(())
    }
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("ROLEFLEET_AGENT_ROLES_FILE", "roles_file"),
    ("ROLEFLEET_AGENT_DETECT_INTERVAL_SECS", "detect_interval_secs"),
    ("ROLEFLEET_AGENT_SERVICE_TIMEOUT_SECS", "service_timeout_secs"),
    ("ROLEFLEET_AGENT_GLOBAL_VERSION_FILE", "global_version_file"),
    ("ROLEFLEET_AGENT_VERSION_FILE", "version_file"),
    ("ROLEFLEET_AGENT_INSTALL_DIR", "install_dir"),
    ("ROLEFLEET_AGENT_STAGING_DIR", "staging_dir"),
    ("ROLEFLEET_AGENT_AGENT_UNIT", "agent_unit"),
    ("ROLEFLEET_AGENT_SYSTEMCTL", "systemctl"),
    ("ROLEFLEET_AGENT_COMMAND_TIMEOUT_SECS", "command_timeout_secs"),
    ("ROLEFLEET_AGENT_REPORT_FILE", "report_file"),
    ("ROLEFLEET_AGENT_METRICS_HOST", "metrics_host"),
    ("ROLEFLEET_AGENT_METRICS_PORT", "metrics_port"),
];

pub fn load() -> anyhow::Result<AppConfig> {
    load_from(None)
}

pub fn load_from(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name("/etc/rolefleet/agent").required(false),
    };

    let mut builder = config::Config::builder()
        .add_source(file)
        .set_default("roles_file", "/etc/rolefleet/roles.yml")?
        .set_default("detect_interval_secs", 60)?
        .set_default("service_timeout_secs", 5)?
        .set_default("global_version_file", "/opt/rolefleet/current/version.json")?
        .set_default("version_file", "/var/lib/rolefleet/agent-version.json")?
        .set_default("install_dir", "/opt/rolefleet")?
        .set_default("staging_dir", "/var/lib/rolefleet/staging")?
        .set_default("agent_unit", "rolefleet-agent.service")?
        .set_default("systemctl", "systemctl")?
        .set_default("command_timeout_secs", 60)?
        .set_default("report_file", Option::<String>::None)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9465)?;

    // Override with single-underscore environment variables.
    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
