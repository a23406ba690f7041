pub mod config;
pub mod definitions;
pub mod detector;
pub mod host;
pub mod runner;
pub mod sync;
pub mod telemetry;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use common::fleet::NodeReport;
use common::roles::SyncStrategy;
use serde::Serialize;

use crate::definitions::load_role_definitions;
use crate::host::SystemHost;
use crate::runner::{detector_for, start_agent, wait_for_shutdown_signal, AgentOptions};
use crate::sync::{PackageActivator, SyncOptions};

#[derive(Debug, Parser)]
#[command(
    name = "rolefleet-agent",
    version,
    about = "rolefleet node agent: role detection and package activation"
)]
pub struct Cli {
    /// Configuration file; defaults to /etc/rolefleet/agent.{toml,yaml,json} when present.
    #[arg(long, global = true, env = "ROLEFLEET_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one detection pass and print the report.
    Detect(DetectArgs),
    /// Detect periodically and serve /metrics until interrupted.
    Run,
    /// Verify and activate the staged code package.
    Sync(SyncArgs),
    /// Print the activated agent version.
    Version(VersionArgs),
}

#[derive(Debug, Clone, Args)]
pub struct DetectArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    #[arg(long, conflicts_with = "no_restart")]
    pub restart: bool,
    #[arg(long)]
    pub no_restart: bool,
    #[arg(long, default_value_t = SyncStrategy::Graceful)]
    pub strategy: SyncStrategy,
    /// Activate this tarball instead of the staged one; its `.sha256` must sit beside it.
    #[arg(long)]
    pub package: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct VersionArgs {
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            restart: !self.no_restart,
            strategy: self.strategy,
            package: self.package.clone(),
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load_from(cli.config.as_deref())?;
    match cli.command {
        Command::Detect(args) => {
            let definitions = load_role_definitions(&cfg.roles_file)?;
            let detector = detector_for(&cfg, Arc::new(SystemHost::new(cfg.systemctl.clone())));
            let report = detector.build_report(&definitions).await;
            if args.json {
                print_json(&report)
            } else {
                print_summary(&report)
            }
        }
        Command::Run => {
            let handle = start_agent(cfg, AgentOptions::default()).await?;
            wait_for_shutdown_signal().await;
            handle.shutdown().await
        }
        Command::Sync(args) => {
            let report = PackageActivator::from_config(&cfg)
                .sync(&args.options())
                .await
                .context("sync failed")?;
            print_json(&report)
        }
        Command::Version(args) => {
            let version = version::read_agent_version(&cfg.version_file)?;
            match (version, args.json) {
                (Some(version), true) => print_json(&version),
                (Some(version), false) => {
                    println!("{} (built {})", version.commit, version.built_at.to_rfc3339());
                    Ok(())
                }
                (None, _) => anyhow::bail!(
                    "no activated version recorded at {}",
                    cfg.version_file.display()
                ),
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{body}")?;
    Ok(())
}

fn print_summary(report: &NodeReport) -> anyhow::Result<()> {
    let mut names: Vec<&String> = report.roles.keys().collect();
    names.sort();
    let mut out = std::io::stdout().lock();
    for name in names {
        let status = &report.roles[name];
        writeln!(
            out,
            "{name:<24} {:<14} {}",
            status.status.as_str(),
            status.version.as_deref().unwrap_or("-")
        )?;
    }
    if let Some(version) = &report.agent_version {
        writeln!(out, "agent commit {}", version.commit)?;
    }
    Ok(())
}
