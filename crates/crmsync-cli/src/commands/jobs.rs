use crmsync_core::sync::{Job, Scheduler};
use tokio::sync::watch;

use crate::commands::common::{print_json, Context};
use crate::error::CliError;

fn scheduler(ctx: &Context) -> Scheduler {
    Scheduler::new(ctx.service.clone(), ctx.config.clone())
}

pub async fn run_job(ctx: &Context, job: Job, as_json: bool) -> Result<(), CliError> {
    let report = scheduler(ctx).run_job(job).await?;
    if as_json {
        return print_json(&report);
    }
    println!(
        "{job}: processed={} failed={}",
        report.processed, report.failed
    );
    Ok(())
}

/// Run the scheduler in the foreground until Ctrl-C
pub async fn run_scheduler(ctx: &Context) -> Result<(), CliError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = scheduler(ctx);
    let loops = tokio::spawn(async move { scheduler.run_forever(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested; waiting for in-flight jobs");
    let _ = shutdown_tx.send(true);
    if let Err(error) = loops.await {
        tracing::error!(%error, "Scheduler task failed");
    }
    Ok(())
}
