//! CLI command definitions for the `wpt` binary.
//!
//! Uses clap derive macros for argument parsing. Every command except
//! `serve` and `completions` works directly against the database and the
//! configured scheduler, so it does not need a running server.

pub mod run;
pub mod serve;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable workflows on top of an at-least-once message scheduler.
#[derive(Parser)]
#[command(name = "wpt", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use the in-process scheduler instead of the configured one.
    #[arg(long, global = true)]
    pub local: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the workflow endpoint server.
    Serve {
        /// Port to listen on (overrides `listen` in config.toml).
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Log as JSON lines.
        #[arg(long)]
        log_json: bool,

        /// Export spans through OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    Runs {
        /// Filter by status (running, waiting, succeeded, failed, canceled, ...).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run with its step ledger and waiters.
    Ledger {
        /// Run id.
        run_id: String,
    },

    /// Start a run of a registered workflow.
    Trigger {
        /// Workflow name.
        workflow: String,

        /// JSON (or raw text) trigger payload.
        #[arg(long)]
        payload: Option<String>,

        /// Caller-chosen run id (idempotent start).
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Resume every run waiting for an event.
    Notify {
        /// Event id the runs wait for.
        event_id: String,

        /// JSON event data.
        #[arg(long)]
        data: Option<String>,
    },

    /// Cancel a live run.
    Cancel {
        /// Run id.
        run_id: String,
    },

    /// Delete settled runs older than the retention period.
    Purge {
        /// Retention in days (defaults to `retention_days` from config.toml).
        #[arg(long)]
        days: Option<u32>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
}
