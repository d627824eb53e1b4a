//! crmsync CLI - operate CRM connections and sync runs from the terminal

mod cli;
mod commands;
mod error;


use clap::Parser;
use crmsync_core::models::ConnectionStatus;
use tracing_subscriber::EnvFilter;

use crate::cli::{
    Cli, Commands, ConflictCommands, ConnectionCommands, JobCommands, MappingCommands,
    SyncCommands,
};
use crate::commands::common::open_context;
use crate::commands::connections::CredentialArgs;
use crate::commands::sync::SyncTarget;
use crate::commands::{completions, conflicts, connections, jobs, mappings, sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so --json output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crmsync=info,crmsync_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let as_json = cli.json;

    // Commands that never touch the database
    match &cli.command {
        Commands::Completions { shell, output } => {
            return completions::run_completions(*shell, output.as_deref());
        }
        Commands::Mappings {
            command: MappingCommands::Defaults { provider },
        } => return mappings::run_defaults(*provider),
        _ => {}
    }

    let ctx = open_context(cli.db_path.as_deref()).await?;

    match cli.command {
        Commands::Connections { command } => match command {
            ConnectionCommands::Add {
                provider,
                tenant,
                token,
                access_token,
                refresh_token,
                expires_at,
                instance_url,
                policy,
                natural_key,
            } => {
                let credential = CredentialArgs {
                    token,
                    access_token,
                    refresh_token,
                    expires_at,
                    instance_url,
                };
                connections::run_add(
                    &ctx,
                    provider,
                    tenant.as_deref(),
                    credential,
                    policy,
                    natural_key,
                    as_json,
                )
                .await?;
            }
            ConnectionCommands::List { tenant } => {
                connections::run_list(&ctx, tenant.as_deref(), as_json).await?;
            }
            ConnectionCommands::Configure {
                id,
                policy,
                natural_key,
            } => connections::run_configure(&ctx, &id, policy, natural_key).await?,
            ConnectionCommands::Pause { id } => {
                connections::run_set_status(&ctx, &id, ConnectionStatus::Paused).await?;
            }
            ConnectionCommands::Resume { id } => {
                connections::run_set_status(&ctx, &id, ConnectionStatus::Active).await?;
            }
            ConnectionCommands::Disconnect { id } => {
                connections::run_set_status(&ctx, &id, ConnectionStatus::Disconnected).await?;
            }
        },
        Commands::Mappings { command } => match command {
            MappingCommands::Show { connection } => {
                mappings::run_show(&ctx, &connection, as_json).await?;
            }
            MappingCommands::Import { connection, file } => {
                mappings::run_import(&ctx, &connection, &file).await?;
            }
            MappingCommands::Defaults { provider } => mappings::run_defaults(provider)?,
        },
        Commands::Sync { command } => match command {
            SyncCommands::Full { connection } => {
                sync::run_sync(&ctx, &connection, SyncTarget::Full, as_json).await?;
            }
            SyncCommands::Delta { connection } => {
                sync::run_sync(&ctx, &connection, SyncTarget::Delta, as_json).await?;
            }
            SyncCommands::Record {
                connection,
                contact,
            } => {
                sync::run_sync(&ctx, &connection, SyncTarget::Record(&contact), as_json).await?;
            }
        },
        Commands::Status { connection } => sync::run_status(&ctx, &connection, as_json).await?,
        Commands::Runs { connection, limit } => {
            sync::run_runs(&ctx, &connection, limit, as_json).await?;
        }
        Commands::Conflicts { command } => match command {
            ConflictCommands::List {
                connection,
                all,
                limit,
            } => conflicts::run_list(&ctx, &connection, all, limit, as_json).await?,
            ConflictCommands::Resolve { id, keep, value } => {
                conflicts::run_resolve(&ctx, &id, keep, value, as_json).await?;
            }
        },
        Commands::Jobs {
            command: JobCommands::Run { job },
        } => jobs::run_job(&ctx, job, as_json).await?,
        Commands::Scheduler => jobs::run_scheduler(&ctx).await?,
        Commands::Completions { shell, output } => {
            completions::run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
