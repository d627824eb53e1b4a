use crmsync_core::models::{ConflictChoice, ConflictStatus, FieldValue};

use crate::cli::KeepSide;
use crate::commands::common::{
    format_conflict_line, parse_conflict_id, parse_connection_id, print_json, Context,
};
use crate::commands::sync::{print_run, wait_interruptibly};
use crate::error::CliError;

pub async fn run_list(
    ctx: &Context,
    connection: &str,
    include_resolved: bool,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let connection_id = parse_connection_id(connection)?;
    ctx.store().require_connection(&connection_id).await?;
    let status = (!include_resolved).then_some(ConflictStatus::Open);
    let conflicts = ctx
        .store()
        .list_conflicts(&connection_id, status, limit)
        .await?;

    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No conflicts recorded.");
        return Ok(());
    }
    for conflict in &conflicts {
        println!("{}", format_conflict_line(conflict));
    }
    Ok(())
}

pub fn choice_from_args(keep: Option<KeepSide>, value: Option<String>) -> ConflictChoice {
    match (keep, value) {
        (Some(KeepSide::Local), _) => ConflictChoice::KeepLocal,
        (Some(KeepSide::Remote), _) => ConflictChoice::KeepRemote,
        (None, Some(value)) if value.trim().is_empty() => ConflictChoice::Custom(FieldValue::Null),
        (None, Some(value)) => ConflictChoice::Custom(FieldValue::Text(value)),
        (None, None) => ConflictChoice::KeepLocal,
    }
}

/// Resolve a conflict and wait for the follow-up run that carries the
/// choice to the provider.
pub async fn run_resolve(
    ctx: &Context,
    id: &str,
    keep: Option<KeepSide>,
    value: Option<String>,
    as_json: bool,
) -> Result<(), CliError> {
    let conflict_id = parse_conflict_id(id)?;
    let resolution = ctx
        .service
        .resolve_conflict(&conflict_id, choice_from_args(keep, value))
        .await?;

    let follow_up = match &resolution.follow_up_run {
        Some(run_id) => Some(wait_interruptibly(ctx, run_id).await?),
        None => None,
    };

    if as_json {
        return print_json(&serde_json::json!({
            "conflict": resolution.conflict,
            "follow_up_run": follow_up,
        }));
    }
    println!("{}", format_conflict_line(&resolution.conflict));
    if let Some(run) = &follow_up {
        print_run(run, false)?;
    }
    Ok(())
}
