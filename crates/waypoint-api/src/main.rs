//! Waypoint CLI and workflow server entry point.
//!
//! Binary name: `wpt`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler or starts the server.

mod cli;
mod demo;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn,waypoint=info",
        1 => "info,waypoint=debug",
        _ => "trace",
    };
    let (log_json, otel) = match &cli.command {
        Commands::Serve { log_json, otel, .. } => (*log_json, *otel),
        _ => (false, false),
    };
    waypoint_observe::tracing_setup::init_tracing(filter, log_json, otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "wpt", &mut std::io::stdout());
        return Ok(());
    }

    let listen = match &cli.command {
        Commands::Serve { host, port: Some(port), .. } => Some(format!("{host}:{port}")),
        _ => None,
    };
    let state = AppState::init(cli.local, listen).await?;

    let result = match cli.command {
        Commands::Serve { .. } => {
            let addr = state.config().listen.clone();
            cli::serve::serve(state, addr).await
        }
        Commands::Runs { status, limit } => {
            cli::run::list_runs(&state, status.as_deref(), limit, cli.json).await
        }
        Commands::Ledger { run_id } => cli::run::show_ledger(&state, &run_id, cli.json).await,
        Commands::Trigger {
            workflow,
            payload,
            run_id,
        } => {
            cli::run::trigger(&state, &workflow, payload.as_deref(), run_id.as_deref(), cli.json).await
        }
        Commands::Notify { event_id, data } => {
            cli::run::notify(&state, &event_id, data.as_deref(), cli.json).await
        }
        Commands::Cancel { run_id } => cli::run::cancel(&state, &run_id, cli.json).await,
        Commands::Purge { days } => cli::run::purge(&state, days, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    };

    waypoint_observe::tracing_setup::shutdown_tracing();
    result
}
