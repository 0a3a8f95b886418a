use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mailrulez::cli::{self, Cli};
use mailrulez::config::{AppConfig, Dirs};
use mailrulez::control::ControlPlane;
use mailrulez::imap_client::{CircuitBreakingConnector, ImapConnector, LimitedConnector, RetryingConnector, TcpImapConnector, DEFAULT_CONNECT_RETRIES};
use mailrulez::retention::{AuditLog, PolicyStore, RetentionManager, RetentionScheduler};
use mailrulez::task_manager::TaskManager;
use mailrulez::{ListStore, RuleStore};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("MAIL_RULEZ_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap();

    let json = std::env::var("MAIL_RULEZ_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let dirs = Dirs::from_env();

    tokio::fs::create_dir_all(&dirs.data)
        .await
        .with_context(|| format!("failed to create data dir {}", dirs.data.display()))?;
    tokio::fs::create_dir_all(&dirs.lists)
        .await
        .with_context(|| format!("failed to create lists dir {}", dirs.lists.display()))?;

    let config_path = if cli.config.is_absolute() {
        cli.config.clone()
    } else {
        dirs.config.join(&cli.config)
    };

    let config = AppConfig::load(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let rules = Arc::new(RuleStore::new(dirs.data.join("rules.json")));
    let lists = Arc::new(ListStore::new(dirs.lists.clone()));
    let policies = Arc::new(PolicyStore::new(dirs.data.join("retention_policies.json")));
    let audit = Arc::new(AuditLog::new(dirs.data.join("audit.log")));

    let base_connector: Arc<dyn ImapConnector> = Arc::new(TcpImapConnector);
    let retrying = Arc::new(RetryingConnector::new(base_connector, DEFAULT_CONNECT_RETRIES));
    let breaking = Arc::new(CircuitBreakingConnector::new(retrying, config.circuit_breaker.clone()));
    let connector: Arc<dyn ImapConnector> = Arc::new(LimitedConnector::new(
        breaking,
        config.execution.max_concurrent_connections,
    ));

    let retention = Arc::new(RetentionManager::new(policies.clone(), audit.clone(), connector.clone()));
    let scheduler = Arc::new(RetentionScheduler::new(retention.clone(), policies.clone(), &config_path));

    let tasks = Arc::new(TaskManager::new(
        rules,
        lists,
        policies.clone(),
        retention.clone(),
        connector.clone(),
        config.execution.clone(),
        config_path.clone(),
    ));
    tasks
        .load_accounts_from_config()
        .await
        .with_context(|| format!("failed to load accounts from {}", config_path.display()))?;

    let control = ControlPlane::new(tasks, scheduler, retention, policies, audit, connector);

    cli::dispatch(&control, cli.command).await
}
