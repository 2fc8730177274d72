//! CLI run management subcommands.
//!
//! Provides runs, ledger, trigger, notify, cancel and purge. Output is a
//! styled table by default and pretty JSON with `--json`.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use waypoint_core::workflow::RunLedger;
use waypoint_types::workflow::{RunId, StepStatus, WorkflowRunStatus};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn list_runs(state: &AppState, status: Option<&str>, limit: u32, json: bool) -> Result<()> {
    let status = status
        .map(str::parse::<WorkflowRunStatus>)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    let runs = state.engine.list_runs(status, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!(
            "  Start one with: {}",
            style("wpt trigger <workflow> --payload '{...}'").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Completed"),
        ]);

    for run in &runs {
        let completed = run
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&run.run_id),
            Cell::new(&run.workflow_name),
            format_status(run.status),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(completed),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub async fn show_ledger(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let ledger = state.engine.ledger(&run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ledger)?);
        return Ok(());
    }
    print_ledger(&ledger);
    Ok(())
}

fn print_ledger(ledger: &RunLedger) {
    let run = &ledger.run;
    println!();
    println!("  {} {}", style("Run").bold(), style(&run.run_id).cyan());
    println!("  Workflow: {}", style(&run.workflow_name).cyan());
    println!("  URL: {}", run.workflow_url);
    println!("  Status: {}", run.status);
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(result) = &run.result {
        println!("  Result: {}", compact(result, 80));
    }
    if let Some(failure) = &run.failure {
        println!("  Failure: {}", style(format!("{} {}", failure.status, failure.body)).red());
    }
    if let Some(response) = &run.failure_response {
        println!("  Failure response: {}", compact(response, 80));
    }

    if !ledger.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Kind"),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Result / Error"),
            ]);

        for step in &ledger.steps {
            let outcome = match (&step.result, &step.error) {
                (Some(result), _) => compact(result, 40),
                (None, Some(error)) => error.message.chars().take(40).collect(),
                (None, None) => "-".to_string(),
            };
            let status = match step.status {
                StepStatus::Pending => Cell::new(step.status).fg(Color::Yellow),
                StepStatus::Succeeded => Cell::new(step.status).fg(Color::Green),
                StepStatus::Failed => Cell::new(step.status).fg(Color::Red),
            };
            table.add_row(vec![
                Cell::new(&step.key),
                Cell::new(step.detail.kind()),
                status,
                Cell::new(step.attempts),
                Cell::new(outcome),
            ]);
        }
        println!();
        println!("{table}");
    }

    if !ledger.waiters.is_empty() {
        println!();
        for waiter in &ledger.waiters {
            println!(
                "  waiter {} on '{}' {} (times out {})",
                waiter.step,
                waiter.event_id,
                waiter.status,
                waiter.timeout_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

pub async fn trigger(
    state: &AppState,
    workflow: &str,
    payload: Option<&str>,
    run_id: Option<&str>,
    json: bool,
) -> Result<()> {
    if state.engine.registry().get(workflow).is_none() {
        bail!(
            "Workflow '{workflow}' is not registered. Known workflows: {}",
            state.engine.registry().names().join(", ")
        );
    }
    let run_id = run_id.map(parse_run_id).transpose()?;
    let url = state.workflow_url(workflow);
    let body = payload.map(|p| p.as_bytes().to_vec()).unwrap_or_default();

    let triggered = state
        .client
        .trigger(&url, body, run_id)
        .await
        .context("Failed to publish trigger message")?;
    state.flush_local().await;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "runId": triggered.run_id,
                "messageId": triggered.message_id,
                "workflowUrl": url,
            })
        );
    } else {
        println!();
        println!(
            "  {} Triggered '{}' as run {}",
            style("*").green().bold(),
            style(workflow).cyan(),
            style(&triggered.run_id).cyan()
        );
        println!("  Message: {}", triggered.message_id);
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

pub async fn notify(state: &AppState, event_id: &str, data: Option<&str>, json: bool) -> Result<()> {
    let data = match data {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        None => Value::Null,
    };
    let results = state.engine.notify(event_id, data).await?;
    state.flush_local().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!();
    if results.is_empty() {
        println!("  No run is waiting for '{}'.", style(event_id).cyan());
    }
    for result in &results {
        match &result.error {
            None => println!(
                "  {} Resumed {} at {}",
                style("*").green().bold(),
                style(&result.waiter.run_id).cyan(),
                result.waiter.step
            ),
            Some(error) => println!(
                "  {} {} at {}: {}",
                style("!").red().bold(),
                style(&result.waiter.run_id).cyan(),
                result.waiter.step,
                error
            ),
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn cancel(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let canceled = state.engine.cancel(&run_id).await?;

    if json {
        println!("{}", serde_json::json!({ "runId": run_id, "canceled": canceled }));
    } else if canceled {
        println!();
        println!("  {} Canceled run {}", style("*").green().bold(), style(&run_id).cyan());
        println!();
    } else {
        bail!("Run '{run_id}' has already settled and cannot be canceled");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

pub async fn purge(state: &AppState, days: Option<u32>, json: bool) -> Result<()> {
    let days = days.unwrap_or(state.config().retention_days);
    let purged = state.engine.purge(days).await?;

    if json {
        println!("{}", serde_json::json!({ "purged": purged, "retentionDays": days }));
    } else {
        println!();
        println!(
            "  {} Purged {} settled run(s) older than {} day(s)",
            style("*").green().bold(),
            purged,
            days
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_run_id(raw: &str) -> Result<RunId> {
    raw.parse::<RunId>().map_err(|e| anyhow::anyhow!(e))
}

fn format_status(status: WorkflowRunStatus) -> Cell {
    let color = match status {
        WorkflowRunStatus::Running => Color::Blue,
        WorkflowRunStatus::Waiting => Color::Magenta,
        WorkflowRunStatus::Succeeded => Color::Green,
        WorkflowRunStatus::FailedPendingCallback => Color::DarkYellow,
        WorkflowRunStatus::Failed => Color::Red,
        WorkflowRunStatus::Canceled => Color::DarkGrey,
    };
    Cell::new(status.as_str().to_lowercase()).fg(color)
}

/// Single-line JSON, truncated to `max` characters.
fn compact(value: &Value, max: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max {
        text
    } else {
        let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compact_truncates_long_values() {
        assert_eq!(compact(&json!({"a": 1}), 40), r#"{"a":1}"#);
        let long = compact(&json!("x".repeat(100)), 20);
        assert_eq!(long.chars().count(), 20);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn test_parse_run_id_rejects_empty() {
        assert!(parse_run_id("  ").is_err());
        assert_eq!(parse_run_id("wfr_1").unwrap().as_str(), "wfr_1");
    }
}
