//! Command-line interface: a thin `clap` front end over [`crate::control::ControlPlane`].
//!
//! Every subcommand maps to exactly one control-plane call and prints its
//! `Outcome`/result as pretty JSON. There is no business logic here; the
//! binary exists for operational use and local testing without standing up
//! the external HTTP collaborator.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::processor::ProcessorMode;
use crate::retention::manager::Stage;

#[derive(Parser, Debug)]
#[command(name = "mailrulez")]
#[command(version)]
#[command(about = "Multi-account IMAP email classification and lifecycle engine", long_about = None)]
pub struct Cli {
    /// Path to the account/execution configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging (equivalent to MAIL_RULEZ_LOG_LEVEL=debug)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show fleet-wide status: every account plus the retention scheduler
    Status,

    /// Show a single account's processor status
    AccountStatus {
        email: String,
    },

    /// Start an account's processor in the given mode
    Start {
        email: String,
        /// "startup" or "maintenance"
        mode: CliMode,
    },

    /// Stop an account's processor
    Stop {
        email: String,
    },

    /// Stop then start an account's processor, preserving its last mode
    Restart {
        email: String,
    },

    /// Switch a running account's processor between startup and maintenance
    SwitchMode {
        email: String,
        mode: CliMode,
    },

    /// Start every configured account's processor
    BulkStart {
        mode: CliMode,
    },

    /// Stop every running account's processor
    BulkStop,

    /// Report which of the four standard folders exist for an account
    FolderStatus {
        email: String,
    },

    /// Create any of the four standard folders that are missing
    CreateFolders {
        email: String,
        /// Required: folder creation is destructive-adjacent and not offered silently
        #[arg(long)]
        confirm: bool,
    },

    /// Classify and dispatch up to `limit` inbox messages (startup mode only)
    ProcessBatch {
        email: String,
        #[arg(default_value_t = 50)]
        limit: usize,
    },

    /// Count messages currently in an account's inbox
    InboxCount {
        email: String,
    },

    /// Reconcile the fleet registry against the accounts in the config file
    Refresh,

    /// Show the most recent fleet lifecycle events
    History {
        #[arg(default_value_t = 50)]
        limit: usize,
    },

    /// Retention operations
    #[command(subcommand)]
    Retention(RetentionCommands),

    /// Trash inspection and restore
    #[command(subcommand)]
    Trash(TrashCommands),

    /// Write an example configuration file to the given path
    InitConfig {
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum RetentionCommands {
    /// Preview what a retention run would move or delete, without acting
    Preview {
        /// Restrict to one account; defaults to every registered account
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        policy: Option<String>,
    },
    /// Run a retention stage
    Execute {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        policy: Option<String>,
        /// "move-to-trash" or "permanent-delete"; omit to run both
        #[arg(long)]
        stage: Option<CliStage>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Query the retention audit log
    Audit {
        #[arg(default_value_t = 30)]
        days_back: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum TrashCommands {
    /// List messages currently sitting in the trash folder
    Contents {
        email: String,
    },
    /// Restore specific trashed messages back to a folder
    Restore {
        email: String,
        /// Comma-separated IMAP UIDs
        uids: String,
        target: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum CliMode {
    Startup,
    Maintenance,
}

impl std::str::FromStr for CliMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "startup" => Ok(CliMode::Startup),
            "maintenance" => Ok(CliMode::Maintenance),
            other => Err(format!("unknown mode '{other}' (expected startup or maintenance)")),
        }
    }
}

impl From<CliMode> for ProcessorMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Startup => ProcessorMode::Startup,
            CliMode::Maintenance => ProcessorMode::Maintenance,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CliStage {
    MoveToTrash,
    PermanentDelete,
}

impl std::str::FromStr for CliStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "move-to-trash" | "move_to_trash" => Ok(CliStage::MoveToTrash),
            "permanent-delete" | "permanent_delete" => Ok(CliStage::PermanentDelete),
            other => Err(format!(
                "unknown stage '{other}' (expected move-to-trash or permanent-delete)"
            )),
        }
    }
}

impl From<CliStage> for Stage {
    fn from(stage: CliStage) -> Self {
        match stage {
            CliStage::MoveToTrash => Stage::MoveToTrash,
            CliStage::PermanentDelete => Stage::PermanentDelete,
        }
    }
}

/// Pretty-prints any serializable control-plane result as JSON. Falls back
/// to the `Display` of the error if serialization itself fails, which
/// should never happen for our own types but keeps the CLI from panicking
/// on a malformed payload.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

fn parse_uids(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|e| anyhow!("invalid uid '{s}': {e}")))
        .collect()
}

/// Runs one parsed command against the control plane and prints its result.
/// Returns an exit-worthy error on hard failures (malformed arguments, I/O
/// errors writing the example config); control-plane `Outcome::success ==
/// false` results are still printed, not raised, since they're part of the
/// normal JSON contract the HTTP layer would also see.
pub async fn dispatch(control: &crate::control::ControlPlane, command: Commands) -> Result<()> {
    match command {
        Commands::Status => print_json(&control.system_status().await),
        Commands::AccountStatus { email } => print_json(&control.account_status(&email).await),
        Commands::Start { email, mode } => print_json(&control.start(&email, mode.into()).await),
        Commands::Stop { email } => print_json(&control.stop(&email).await),
        Commands::Restart { email } => print_json(&control.restart(&email).await),
        Commands::SwitchMode { email, mode } => print_json(&control.switch_mode(&email, mode.into()).await),
        Commands::BulkStart { mode } => print_json(&control.bulk_start(mode.into()).await),
        Commands::BulkStop => print_json(&control.bulk_stop().await),
        Commands::FolderStatus { email } => print_json(&control.folder_status(&email).await),
        Commands::CreateFolders { email, confirm } => print_json(&control.create_folders(&email, confirm).await),
        Commands::ProcessBatch { email, limit } => print_json(&control.process_batch(&email, limit).await),
        Commands::InboxCount { email } => print_json(&control.inbox_count(&email).await),
        Commands::Refresh => print_json(&control.refresh_accounts().await),
        Commands::History { limit } => print_json(&control.task_history(limit).await),
        Commands::Retention(cmd) => dispatch_retention(control, cmd).await,
        Commands::Trash(cmd) => dispatch_trash(control, cmd).await?,
        Commands::InitConfig { output, force } => write_init_config(&output, force).await?,
    }
    Ok(())
}

async fn dispatch_retention(control: &crate::control::ControlPlane, command: RetentionCommands) {
    match command {
        RetentionCommands::Preview { email, policy } => {
            print_json(&control.retention_preview(email.as_deref(), policy.as_deref()).await)
        }
        RetentionCommands::Execute {
            email,
            policy,
            stage,
            dry_run,
        } => print_json(
            &control
                .retention_execute(email.as_deref(), policy.as_deref(), stage.map(Into::into), dry_run)
                .await,
        ),
        RetentionCommands::Audit { days_back } => print_json(&control.retention_audit(days_back).await),
    }
}

async fn dispatch_trash(control: &crate::control::ControlPlane, command: TrashCommands) -> Result<()> {
    match command {
        TrashCommands::Contents { email } => print_json(&control.trash_contents(&email).await),
        TrashCommands::Restore { email, uids, target } => {
            let uids = parse_uids(&uids)?;
            print_json(&control.trash_restore(&email, &uids, &target).await);
        }
    }
    Ok(())
}

async fn write_init_config(output: &std::path::Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", output.display());
    }
    let config = crate::config::AppConfig::create_example();
    config
        .save(output)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("wrote example configuration to {}", output.display());
    Ok(())
}
