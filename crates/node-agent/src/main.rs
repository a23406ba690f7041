use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    node_agent::telemetry::init_tracing();
    let cli = node_agent::Cli::parse();
    tracing::debug!(command = ?cli.command, "rolefleet-agent starting");
    node_agent::run(cli).await
}
