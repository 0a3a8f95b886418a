//! Task manager: the fleet registry of per-account email processors.
//!
//! Owns processor lifecycle (add/remove/start/stop/switch_mode), reloads the
//! account registry from configuration, takes aggregate stats as atomic
//! per-processor snapshots, and keeps a ring-buffered task history. Mirrors
//! the processor's own lock discipline: the registry mutex is never held
//! across a processor start/stop call, so two accounts can start or stop
//! concurrently without contending on the registry.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::config::{Account, AppConfig, ExecutionConfig};
use crate::error::{MailRulezError, Result};
use crate::imap_client::ImapConnector;
use crate::lists::ListStore;
use crate::processor::{EmailProcessor, ProcessorMode, ProcessorState, ProcessorStats};
use crate::retention::{PolicyStore, RetentionManager};
use crate::rules::RuleStore;

/// Ring-buffer capacity for [`TaskManager::task_history`].
const MAX_HISTORY_SIZE: usize = 1000;
/// Auto-transition polling cadence: the task manager is polled far more
/// often than this by its caller, but only acts once per hour.
const AUTO_TRANSITION_CHECK_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize)]
pub struct TaskHistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub total_accounts: usize,
    pub emails_processed: u64,
    pub emails_pending: u64,
    pub error_count: u64,
    pub running: usize,
    pub stopped: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub email: String,
    pub state: ProcessorState,
    pub mode: Option<ProcessorMode>,
    pub stats: ProcessorStats,
}

pub struct TaskManager {
    processors: RwLock<HashMap<String, Arc<EmailProcessor>>>,
    rules: Arc<RuleStore>,
    lists: Arc<ListStore>,
    policies: Arc<PolicyStore>,
    retention: Arc<RetentionManager>,
    connector: Arc<dyn ImapConnector>,
    execution: ExecutionConfig,
    config_path: PathBuf,
    history: Mutex<VecDeque<TaskHistoryEntry>>,
    last_auto_check: Mutex<Option<Instant>>,
}

impl TaskManager {
    pub fn new(
        rules: Arc<RuleStore>,
        lists: Arc<ListStore>,
        policies: Arc<PolicyStore>,
        retention: Arc<RetentionManager>,
        connector: Arc<dyn ImapConnector>,
        execution: ExecutionConfig,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
            rules,
            lists,
            policies,
            retention,
            connector,
            execution,
            config_path: config_path.into(),
            history: Mutex::new(VecDeque::new()),
            last_auto_check: Mutex::new(None),
        }
    }

    async fn record(&self, kind: &str, details: impl Into<String>) {
        let mut history = self.history.lock().await;
        if history.len() >= MAX_HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(TaskHistoryEntry {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            details: details.into(),
        });
    }

    /// Last `limit` entries, newest first.
    pub async fn task_history(&self, limit: usize) -> Vec<TaskHistoryEntry> {
        let history = self.history.lock().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn processor(&self, email: &str) -> Option<Arc<EmailProcessor>> {
        self.processors.read().await.get(email).cloned()
    }

    pub async fn account_emails(&self) -> Vec<String> {
        self.processors.read().await.keys().cloned().collect()
    }

    fn build_processor(&self, account: Account) -> Arc<EmailProcessor> {
        EmailProcessor::new(
            account,
            self.connector.clone(),
            self.rules.clone(),
            self.lists.clone(),
            self.policies.clone(),
            self.retention.clone(),
            self.execution.clone(),
        )
    }

    fn not_found(email: &str) -> MailRulezError {
        MailRulezError::AccountNotFound {
            account: email.to_string(),
        }
    }

    pub async fn add_account(&self, account: Account) -> Result<()> {
        let email = account.email.clone();
        let processor = self.build_processor(account);
        self.processors.write().await.insert(email.clone(), processor);
        self.record("add_account", format!("added {email}")).await;
        Ok(())
    }

    /// Stops the processor (best-effort) before dropping it from the
    /// registry; a stop failure does not block removal.
    pub async fn remove_account(&self, email: &str) -> Result<()> {
        let processor = self.processors.write().await.remove(email);
        if let Some(processor) = processor {
            if processor.state().await != ProcessorState::Stopped {
                if let Err(e) = processor.stop().await {
                    warn!(account = email, error = %e, "processor did not stop cleanly before removal");
                }
            }
        }
        self.record("remove_account", format!("removed {email}")).await;
        Ok(())
    }

    pub async fn start(&self, email: &str, mode: ProcessorMode) -> Result<()> {
        let processor = self.processor(email).await.ok_or_else(|| Self::not_found(email))?;
        let result = processor.start(mode).await;
        self.record("start", format!("start {email} ({mode:?}): {}", outcome_text(&result)))
            .await;
        result
    }

    pub async fn stop(&self, email: &str) -> Result<()> {
        let processor = self.processor(email).await.ok_or_else(|| Self::not_found(email))?;
        let result = processor.stop().await;
        self.record("stop", format!("stop {email}: {}", outcome_text(&result))).await;
        result
    }

    pub async fn restart(&self, email: &str) -> Result<()> {
        let processor = self.processor(email).await.ok_or_else(|| Self::not_found(email))?;
        let result = processor.restart().await;
        self.record("restart", format!("restart {email}: {}", outcome_text(&result)))
            .await;
        result
    }

    pub async fn switch_mode(&self, email: &str, mode: ProcessorMode) -> Result<()> {
        let processor = self.processor(email).await.ok_or_else(|| Self::not_found(email))?;
        let result = processor.switch_mode(mode).await;
        self.record(
            "switch_mode",
            format!("switch_mode {email} -> {mode:?}: {}", outcome_text(&result)),
        )
        .await;
        result
    }

    pub async fn bulk_start(&self, mode: ProcessorMode) -> HashMap<String, Result<()>> {
        let emails = self.account_emails().await;
        let mut results = HashMap::new();
        for email in emails {
            let r = self.start(&email, mode).await;
            results.insert(email, r);
        }
        results
    }

    pub async fn bulk_stop(&self) -> HashMap<String, Result<()>> {
        let emails = self.account_emails().await;
        let mut results = HashMap::new();
        for email in emails {
            let r = self.stop(&email).await;
            results.insert(email, r);
        }
        results
    }

    /// Loads accounts from the configuration file and syncs the registry:
    /// adds a processor for every newly-configured account, removes one for
    /// every account no longer present. Returns (before, after) counts.
    pub async fn load_accounts_from_config(&self) -> Result<(usize, usize)> {
        let before = self.processors.read().await.len();
        let config = AppConfig::load(&self.config_path).await?;
        let configured: HashMap<String, Account> =
            config.accounts.into_iter().map(|a| (a.email.clone(), a)).collect();

        let stale: Vec<String> = self
            .processors
            .read()
            .await
            .keys()
            .filter(|e| !configured.contains_key(*e))
            .cloned()
            .collect();
        for email in stale {
            self.remove_account(&email).await?;
        }

        for (email, account) in configured {
            let already_present = self.processors.read().await.contains_key(&email);
            if !already_present {
                self.add_account(account).await?;
            }
        }

        let after = self.processors.read().await.len();
        self.record("load_accounts_from_config", format!("{before} -> {after} accounts"))
            .await;
        Ok((before, after))
    }

    pub async fn refresh_accounts_from_config(&self) -> Result<(usize, usize)> {
        self.load_accounts_from_config().await
    }

    /// Sums a `stats_snapshot()` taken under each processor's own lock, so
    /// the total is consistent even while processors mutate their stats
    /// concurrently. Called before the registry is ever populated (e.g. an
    /// HTTP poll racing startup), this naturally returns zeros with
    /// `total_accounts == 0` rather than panicking or blocking.
    pub async fn get_aggregate_stats(&self) -> AggregateStats {
        let processors: Vec<Arc<EmailProcessor>> = self.processors.read().await.values().cloned().collect();
        let mut totals = AggregateStats {
            total_accounts: processors.len(),
            ..Default::default()
        };
        for processor in &processors {
            let stats = processor.stats_snapshot().await;
            totals.emails_processed += stats.emails_processed;
            totals.emails_pending += stats.emails_pending;
            totals.error_count += stats.error_count;
            match processor.state().await {
                ProcessorState::Stopped => totals.stopped += 1,
                ProcessorState::Error => totals.errored += 1,
                _ => totals.running += 1,
            }
        }
        totals
    }

    pub async fn system_status(&self) -> Vec<AccountStatus> {
        let processors: Vec<(String, Arc<EmailProcessor>)> = self
            .processors
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = Vec::with_capacity(processors.len());
        for (email, processor) in processors {
            out.push(AccountStatus {
                email,
                state: processor.state().await,
                mode: processor.mode().await,
                stats: processor.stats_snapshot().await,
            });
        }
        out
    }

    pub async fn account_status(&self, email: &str) -> Option<AccountStatus> {
        let processor = self.processor(email).await?;
        Some(AccountStatus {
            email: email.to_string(),
            state: processor.state().await,
            mode: processor.mode().await,
            stats: processor.stats_snapshot().await,
        })
    }

    /// Auto-transition check, rate-limited to once per hour regardless of
    /// how often the caller polls. Returns the emails promoted to
    /// maintenance mode on this call (empty when rate-limited or when
    /// nothing qualified).
    pub async fn check_auto_transitions(&self) -> Vec<String> {
        {
            let mut last = self.last_auto_check.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed().as_secs() < AUTO_TRANSITION_CHECK_INTERVAL_SECS {
                    return Vec::new();
                }
            }
            *last = Some(Instant::now());
        }

        let processors: Vec<(String, Arc<EmailProcessor>)> = self
            .processors
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut promoted = Vec::new();
        for (email, processor) in processors {
            if processor.ready_for_maintenance().await {
                match processor.switch_mode(ProcessorMode::Maintenance).await {
                    Ok(()) => {
                        self.record("auto_transition", format!("{email} promoted to maintenance"))
                            .await;
                        promoted.push(email);
                    }
                    Err(e) => warn!(account = %email, error = %e, "auto-transition switch_mode failed"),
                }
            }
        }
        promoted
    }
}

fn outcome_text(result: &Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}
