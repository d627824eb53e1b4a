use crmsync_core::models::{RunId, RunStatus, SyncRun};

use crate::commands::common::{
    format_run_line, parse_connection_id, parse_contact_id, print_json, Context,
    RUN_POLL_INTERVAL,
};
use crate::error::CliError;

pub enum SyncTarget<'a> {
    Full,
    Delta,
    Record(&'a str),
}

/// Start a run and wait for it; Ctrl-C asks the run to stop after the
/// record in flight.
pub async fn run_sync(
    ctx: &Context,
    connection: &str,
    target: SyncTarget<'_>,
    as_json: bool,
) -> Result<(), CliError> {
    let connection_id = parse_connection_id(connection)?;
    let run_id = match target {
        SyncTarget::Full => ctx.service.trigger_full_sync(&connection_id).await?,
        SyncTarget::Delta => ctx.service.trigger_delta_sync(&connection_id).await?,
        SyncTarget::Record(contact) => {
            let contact_id = parse_contact_id(contact)?;
            ctx.service
                .trigger_single_record_sync(&connection_id, &contact_id)
                .await?
        }
    };

    let run = wait_interruptibly(ctx, &run_id).await?;
    print_run(&run, as_json)
}

pub async fn wait_interruptibly(ctx: &Context, run_id: &RunId) -> Result<SyncRun, CliError> {
    tokio::select! {
        run = ctx.service.wait_for_run(run_id, RUN_POLL_INTERVAL) => Ok(run?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling run {run_id}...");
            ctx.service.cancel_run(run_id).await;
            Ok(ctx.service.wait_for_run(run_id, RUN_POLL_INTERVAL).await?)
        }
    }
}

pub fn print_run(run: &SyncRun, as_json: bool) -> Result<(), CliError> {
    if as_json {
        return print_json(run);
    }

    println!("{}", format_run_line(run));
    for entry in &run.errors {
        let record = entry
            .local_id
            .map(|id| id.to_string())
            .or_else(|| entry.external_id.clone())
            .unwrap_or_default();
        println!("  {:<12} {record}  {}", entry.kind.as_str(), entry.message);
    }
    if run.status == RunStatus::Skipped {
        println!("Another run holds this connection; nothing was done.");
    }
    Ok(())
}

pub async fn run_status(ctx: &Context, connection: &str, as_json: bool) -> Result<(), CliError> {
    let connection_id = parse_connection_id(connection)?;
    let status = ctx.service.get_sync_status(&connection_id).await?;
    if as_json {
        return print_json(&status);
    }

    let connection = &status.connection;
    println!("Connection:     {} ({})", connection.id, connection.provider);
    println!("Status:         {}", connection.status.as_str());
    println!("Policy:         {}", connection.conflict_policy.as_str());
    println!("Linked records: {}", status.linked_records);
    println!("Open conflicts: {}", status.open_conflicts);
    println!("Retry queue:    {}", status.pending_failures);
    if let Some(run_id) = &status.running_run_id {
        println!("Running:        {run_id}");
    }
    if let Some(error) = &connection.last_error {
        println!("Last error:     {error}");
    }
    if let Some(run) = &status.last_run {
        println!("Last run:       {}", format_run_line(run));
    }
    if let Some(run) = &status.last_completed_run {
        println!("Last completed: {}", format_run_line(run));
    }
    Ok(())
}

pub async fn run_runs(
    ctx: &Context,
    connection: &str,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let connection_id = parse_connection_id(connection)?;
    let runs = ctx.service.list_recent_runs(&connection_id, limit).await?;
    if as_json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }
    for run in &runs {
        println!("{}", format_run_line(run));
    }
    Ok(())
}
