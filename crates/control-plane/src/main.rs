use clap::Parser;

#[tokio::main]
async fn main() -> control_plane::Result<()> {
    control_plane::telemetry::init_tracing();
    let cli = control_plane::Cli::parse();
    tracing::debug!(command = ?cli.command, "rolefleet-cp starting");
    control_plane::run(cli).await
}
