pub mod app_state;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod distributor;
pub mod error;
pub mod manifest;
pub mod policy;
pub mod reconcile;
pub mod store;
pub mod telemetry;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use common::roles::SyncStrategy;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::app_state::AppState;
use crate::distributor::{RolloutOptions, RolloutTarget};

#[derive(Debug, Parser)]
#[command(
    name = "rolefleet-cp",
    version,
    about = "rolefleet control plane: role policy, rollouts and service discovery"
)]
pub struct Cli {
    /// Configuration file; defaults to ./config.{toml,yaml,json} when present.
    #[arg(long, global = true, env = "ROLEFLEET_CP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reconcile loop and serve /metrics until interrupted.
    Serve(ServeArgs),
    /// Run one reconcile sweep and print the result.
    Reconcile(ReconcileArgs),
    /// Pull reports from every node over SSH and print a summary.
    Collect,
    /// Resolve the policy for a role set.
    Policy(PolicyArgs),
    /// Build (or reuse) the agent package for a commit.
    Package(PackageArgs),
    /// Build, stage and activate the agent package on nodes.
    Rollout(RolloutArgs),
    /// Look up instances of a service.
    Discover(DiscoverArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Commit nodes are expected to run; enables version drift checks.
    #[arg(long)]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ReconcileArgs {
    #[arg(long)]
    pub commit: Option<String>,
    /// Pull fresh reports before reconciling, even when disabled in config.
    #[arg(long, conflicts_with = "no_collect")]
    pub collect: bool,
    /// Reconcile against stored reports only.
    #[arg(long)]
    pub no_collect: bool,
}

#[derive(Debug, Clone, Args)]
pub struct PolicyArgs {
    #[arg(required = true)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct PackageArgs {
    /// Commit to package; defaults to the repository HEAD.
    #[arg(long)]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RolloutArgs {
    #[arg(long)]
    pub commit: Option<String>,
    /// Limit the rollout to these node ids; repeatable.
    #[arg(long = "node")]
    pub nodes: Vec<String>,
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long, conflicts_with = "no_restart")]
    pub restart: bool,
    #[arg(long)]
    pub no_restart: bool,
    #[arg(long)]
    pub strategy: Option<SyncStrategy>,
}

#[derive(Debug, Clone, Args)]
pub struct DiscoverArgs {
    pub service: String,
    /// Print every instance instead of the preferred one.
    #[arg(long)]
    pub all: bool,
    /// Do not prefer healthy instances.
    #[arg(long)]
    pub any: bool,
    /// Pull fresh reports before answering, even when disabled in config.
    #[arg(long, conflicts_with = "no_collect")]
    pub collect: bool,
    /// Answer from stored reports only.
    #[arg(long)]
    pub no_collect: bool,
}

/// Explicit flags win over `reconcile.collect_reports`.
fn should_collect(collect: bool, no_collect: bool, configured: bool) -> bool {
    !no_collect && (collect || configured)
}

impl RolloutArgs {
    pub fn options(&self, base: RolloutOptions) -> RolloutOptions {
        let restart = if self.no_restart {
            false
        } else {
            self.restart || base.restart
        };
        RolloutOptions {
            concurrency: self.concurrency.unwrap_or(base.concurrency).max(1),
            restart,
            strategy: self.strategy.unwrap_or(base.strategy),
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_from(cli.config.as_deref())?;
    let state = AppState::from_config(cfg)?;
    run_with_state(cli.command, state).await
}

pub async fn run_with_state(command: Command, state: AppState) -> Result<()> {
    match command {
        Command::Serve(args) => serve(state, args, shutdown_signal()).await,
        Command::Reconcile(args) => {
            let collect = should_collect(
                args.collect,
                args.no_collect,
                state.config.reconcile.collect_reports,
            );
            let results = state.reconciler(args.commit, collect).sweep().await?;
            print_json(&results)
        }
        Command::Collect => {
            let collection = state.report_collection();
            let summary = collector::collect_fleet(
                state.store.as_ref(),
                &collection.distributor,
                collection.concurrency,
                collection.timeout,
            )
            .await?;
            print_json(&summary)
        }
        Command::Policy(args) => {
            let policy = policy::resolve_with_loader(&args.roles, &state.loader);
            print_json(&policy)?;
            if policy.is_blocked() {
                anyhow::bail!(
                    "role set has {} hard conflict(s)",
                    policy.hard_conflicts.len()
                );
            }
            Ok(())
        }
        Command::Package(args) => {
            let package = state.distributor.build_package(args.commit.as_deref()).await?;
            print_json(&package)
        }
        Command::Rollout(args) => rollout(state, args).await,
        Command::Discover(args) => discover(state, args).await,
    }
}

async fn rollout(state: AppState, args: RolloutArgs) -> Result<()> {
    let options = args.options(RolloutOptions::from(&state.config.rollout));
    let nodes = state.store.list_nodes().await?;
    let wanted: BTreeSet<&str> = args.nodes.iter().map(String::as_str).collect();
    if let Some(unknown) = wanted
        .iter()
        .find(|id| !nodes.iter().any(|n| n.node_id == **id))
    {
        anyhow::bail!("unknown node '{unknown}'");
    }

    let targets: Vec<RolloutTarget> = nodes
        .into_iter()
        .filter(|n| wanted.is_empty() || wanted.contains(n.node_id.as_str()))
        .map(|record| RolloutTarget {
            policy: policy::resolve_with_loader(&record.assigned_roles, &state.loader),
            record,
        })
        .collect();
    if targets.is_empty() {
        anyhow::bail!("no nodes to roll out to");
    }

    let package = state
        .distributor
        .build_package(args.commit.as_deref())
        .await
        .context("failed to build agent package")?;
    let report = state
        .distributor
        .rollout(&package, targets, &options)
        .await?;
    print_json(&report)?;
    if report.failed() > 0 {
        anyhow::bail!("{} node(s) failed to sync", report.failed());
    }
    Ok(())
}

async fn discover(state: AppState, args: DiscoverArgs) -> Result<()> {
    if should_collect(args.collect, args.no_collect, state.config.reconcile.collect_reports) {
        let collection = state.report_collection();
        collector::collect_fleet(
            state.store.as_ref(),
            &collection.distributor,
            collection.concurrency,
            collection.timeout,
        )
        .await?;
    }
    let discovery = state.discovery();
    if args.all {
        print_json(&discovery.discover_all(&args.service).await?)
    } else {
        print_json(&discovery.discover(&args.service, !args.any).await?)
    }
}

/// Run the reconcile loop and the metrics endpoint until `shutdown` resolves.
pub async fn serve<F>(state: AppState, args: ServeArgs, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let metrics_handle = telemetry::init_metrics_recorder();
    let metrics_addr: SocketAddr = format!(
        "{}:{}",
        state.config.metrics.host, state.config.metrics.port
    )
    .parse()
    .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let reconciler = state.reconciler(args.commit, state.config.reconcile.collect_reports);
    let mut reconcile_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let mut metrics_shutdown = shutdown_rx.clone();
    let mut metrics_task = tokio::spawn(telemetry::serve_metrics_with_shutdown(
        metrics_handle,
        metrics_addr,
        async move {
            let _ = metrics_shutdown.changed().await;
        },
    ));
    info!(%metrics_addr, "control plane serving");

    tokio::select! {
        res = &mut reconcile_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("reconcile task failed: {err}"))?;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))??;
        }
    }

    if !reconcile_task.is_finished() {
        reconcile_task
            .await
            .map_err(|err| anyhow::anyhow!("reconcile task failed: {err}"))?;
    }
    if !metrics_task.is_finished() {
        metrics_task
            .await
            .map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))??;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<Option<()>>().await
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
