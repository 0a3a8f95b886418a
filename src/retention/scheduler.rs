//! Retention scheduler: a single background worker that fires
//! `execute_all` once a day at `global_settings.scheduler_hour`, with an
//! interruptible sleep so shutdown completes within about a minute.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{MailRulezError, Result};

use super::manager::{RetentionManager, Stage};
use super::policy::PolicyStore;

const WAKE_GRANULARITY: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub emails_moved_to_trash: u64,
    pub emails_permanently_deleted: u64,
    pub last_duration_secs: Option<f64>,
    pub last_run_date: Option<NaiveDate>,
}

pub struct RetentionScheduler {
    manager: Arc<RetentionManager>,
    policies: Arc<PolicyStore>,
    config_path: std::path::PathBuf,
    stats: RwLock<SchedulerStats>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl RetentionScheduler {
    pub fn new(manager: Arc<RetentionManager>, policies: Arc<PolicyStore>, config_path: impl Into<std::path::PathBuf>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            manager,
            policies,
            config_path: config_path.into(),
            stats: RwLock::new(SchedulerStats::default()),
            stop_tx,
            stop_rx,
        }
    }

    pub async fn stats_snapshot(&self) -> SchedulerStats {
        self.stats.read().await.clone()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Runs until `stop()` is called. Checks once a minute whether the
    /// current local hour matches `scheduler_hour` and today's execution
    /// has not happened yet.
    pub async fn run(&self) {
        let mut stop_rx = self.stop_rx.clone();
        loop {
            if *stop_rx.borrow() {
                return;
            }

            let doc = match self.policies.load().await {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "retention scheduler failed to load policies, retrying next tick");
                    if Self::wait_or_stop(&mut stop_rx).await {
                        return;
                    }
                    continue;
                }
            };

            if !doc.global_settings.scheduler_enabled {
                if Self::wait_or_stop(&mut stop_rx).await {
                    return;
                }
                continue;
            }

            let now = Local::now();
            let already_ran_today = self
                .stats
                .read()
                .await
                .last_run_date
                .map(|d| d == now.date_naive())
                .unwrap_or(false);

            if now.hour_matches(doc.global_settings.scheduler_hour) && !already_ran_today {
                info!("retention scheduler: executing daily run");
                let _ = self.execute_all().await;
            }

            if Self::wait_or_stop(&mut stop_rx).await {
                return;
            }
        }
    }

    /// Sleeps in `WAKE_GRANULARITY` increments so a stop signal is observed
    /// within about a minute. Returns true if a stop was observed.
    async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(WAKE_GRANULARITY) => false,
            _ = stop_rx.changed() => *stop_rx.borrow(),
        }
    }

    /// Loads accounts from configuration, skipping environment-derived
    /// synthetic accounts, and runs the full lifecycle for each.
    pub async fn execute_all(&self) -> Result<SchedulerStats> {
        let start = std::time::Instant::now();
        let config = AppConfig::load(&self.config_path).await?;

        let mut executions = 0u64;
        let mut successes = 0u64;
        let mut failures = 0u64;
        let mut moved = 0u64;
        let mut deleted = 0u64;

        for account in config.accounts.iter().filter(|a| !a.env_derived) {
            executions += 1;
            match self.manager.run_for_account(account, None, false).await {
                Ok(results) => {
                    for r in &results {
                        if r.success {
                            successes += 1;
                            match r.stage {
                                Stage::MoveToTrash => moved += r.affected as u64,
                                Stage::PermanentDelete => deleted += r.affected as u64,
                            }
                        } else {
                            failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(account = %account.email, error = %e, "retention run_for_account failed");
                    failures += 1;
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.executions += executions;
        stats.successes += successes;
        stats.failures += failures;
        stats.emails_moved_to_trash += moved;
        stats.emails_permanently_deleted += deleted;
        stats.last_duration_secs = Some(start.elapsed().as_secs_f64());
        stats.last_run_date = Some(Local::now().date_naive());

        Ok(stats.clone())
    }

    /// Externally callable single-account/single-policy form. Raises a
    /// typed error without mutating state if the account or policy is
    /// unknown.
    pub async fn run_manual(
        &self,
        account_email: Option<&str>,
        policy_id: Option<&str>,
        stage: Option<Stage>,
        dry_run: bool,
    ) -> Result<Vec<super::manager::StageResult>> {
        let config = AppConfig::load(&self.config_path).await?;

        let accounts: Vec<&crate::config::Account> = match account_email {
            Some(email) => {
                let found = config.accounts.iter().find(|a| a.email == email);
                match found {
                    Some(a) => vec![a],
                    None => {
                        return Err(MailRulezError::AccountNotFound {
                            account: email.to_string(),
                        })
                    }
                }
            }
            None => config.accounts.iter().collect(),
        };

        if let Some(id) = policy_id {
            let doc = self.policies.load().await?;
            if doc.by_id(id).is_none() {
                return Err(MailRulezError::PolicyNotFound { id: id.to_string() });
            }
        }

        let mut all_results = Vec::new();
        for account in accounts {
            if let Some(id) = policy_id {
                let doc = self.policies.load().await?;
                let policy = doc.by_id(id).unwrap().clone();
                let result = self
                    .manager
                    .stage1_move_to_trash(account, &policy, &doc, None, dry_run)
                    .await?;
                all_results.push(result);
            } else {
                all_results.extend(self.manager.run_for_account(account, stage, dry_run).await?);
            }
        }
        Ok(all_results)
    }
}

trait LocalHourExt {
    fn hour_matches(&self, hour: u8) -> bool;
}

impl LocalHourExt for chrono::DateTime<Local> {
    fn hour_matches(&self, hour: u8) -> bool {
        use chrono::Timelike;
        self.hour() == hour as u32
    }
}
