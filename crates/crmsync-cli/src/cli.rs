use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use crmsync_core::models::{ConflictPolicy, NaturalKey, Provider};
use crmsync_core::sync::Job;

#[derive(Parser)]
#[command(name = "crmsync")]
#[command(about = "Keep platform contacts in sync with HubSpot, Salesforce and Pipedrive")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the sync database (overrides CRMSYNC_DATABASE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage CRM connections
    Connections {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
    /// Inspect and replace field mappings
    Mappings {
        #[command(subcommand)]
        command: MappingCommands,
    },
    /// Run a sync and wait for it to finish
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Show sync health for a connection
    Status {
        /// Connection ID
        connection: String,
    },
    /// List recent sync runs
    Runs {
        /// Connection ID
        connection: String,
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// List and resolve field conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Run maintenance jobs by hand
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Run every recurring job on its interval until interrupted
    Scheduler,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum ConnectionCommands {
    /// Register a connection and store its credential
    Add {
        /// hubspot, salesforce or pipedrive
        #[arg(long)]
        provider: Provider,
        /// Owning tenant (a new tenant ID when omitted)
        #[arg(long, value_name = "ID")]
        tenant: Option<String>,
        /// Static API token (Pipedrive, HubSpot private apps)
        #[arg(long, value_name = "TOKEN", conflicts_with = "access_token")]
        token: Option<String>,
        /// OAuth access token
        #[arg(long, value_name = "TOKEN")]
        access_token: Option<String>,
        /// OAuth refresh token
        #[arg(long, value_name = "TOKEN", requires = "access_token")]
        refresh_token: Option<String>,
        /// Access token expiry as unix seconds
        #[arg(long, value_name = "SECONDS", requires = "access_token")]
        expires_at: Option<i64>,
        /// Salesforce instance URL
        #[arg(long, value_name = "URL")]
        instance_url: Option<String>,
        /// Conflict policy
        #[arg(long, default_value = "newest_wins")]
        policy: ConflictPolicy,
        /// Field used to pair records on first contact
        #[arg(long, default_value = "email")]
        natural_key: NaturalKey,
    },
    /// List connections
    List {
        /// Only connections of this tenant
        #[arg(long, value_name = "ID")]
        tenant: Option<String>,
    },
    /// Change a connection's conflict policy or natural key
    Configure {
        /// Connection ID
        id: String,
        #[arg(long)]
        policy: Option<ConflictPolicy>,
        #[arg(long)]
        natural_key: Option<NaturalKey>,
    },
    /// Stop scheduled and triggered runs for a connection
    Pause {
        /// Connection ID
        id: String,
    },
    /// Re-activate a paused or failing connection
    Resume {
        /// Connection ID
        id: String,
    },
    /// Permanently stop syncing a connection
    Disconnect {
        /// Connection ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum MappingCommands {
    /// Show a connection's mapping rows
    Show {
        /// Connection ID
        connection: String,
    },
    /// Replace a connection's mappings with rows from a JSON file
    Import {
        /// Connection ID
        connection: String,
        /// JSON array of mapping rows
        #[arg(value_name = "PATH")]
        file: PathBuf,
    },
    /// Print a provider's default mappings as JSON
    Defaults {
        /// hubspot, salesforce or pipedrive
        provider: Provider,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Re-evaluate every record, ignoring checkpoints
    Full {
        /// Connection ID
        connection: String,
    },
    /// Only records changed since the last run
    Delta {
        /// Connection ID
        connection: String,
    },
    /// Sync one local contact
    Record {
        /// Connection ID
        connection: String,
        /// Local contact ID
        contact: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts for a connection
    List {
        /// Connection ID
        connection: String,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Settle an open conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// Keep one side's value
        #[arg(long, value_enum, conflicts_with = "value", required_unless_present = "value")]
        keep: Option<KeepSide>,
        /// Use this value on both sides (empty clears the field)
        #[arg(long, value_name = "TEXT")]
        value: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Run one job once
    Run {
        /// delta-sync, health-check, conflict-sweep, retry-sweep or log-cleanup
        job: Job,
    },
}
