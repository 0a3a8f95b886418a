//! Control-plane adapter: the thin request/response surface the HTTP
//! collaborator drives. Every operation here is a direct library call with
//! no network I/O of its own; it never holds a lock across an `await` that
//! reaches into the IMAP adapter, and reads aggregate stats exclusively
//! through [`EmailProcessor::stats_snapshot`] (via the task manager), never
//! by touching a processor's internals directly.
//!
//! Typed errors from the stores and workers below are collapsed into
//! [`Outcome`] here, at the boundary — everywhere else in the crate keeps
//! propagating [`crate::error::MailRulezError`] through `?`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::imap_client::ImapConnector;
use crate::processor::{BatchReport, FolderStatus, ProcessorMode};
use crate::retention::manager::{PreviewReport, Stage, StageResult};
use crate::retention::{AuditLog, AuditReport, PolicyStore, RetentionManager, RetentionScheduler, TrashItem, TrashManager};
use crate::task_manager::{AccountStatus, TaskHistoryEntry, TaskManager};

/// Stable success/error envelope every control-plane call returns. Dry-run
/// retention calls are always `success: true` — any would-be failure rides
/// along in the payload (see [`StageResult::error`]), never as `error` here.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> Outcome<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }
    }

    fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(v) => Self::ok(v),
            Err(e) => Self::err(e),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub accounts: Vec<AccountStatus>,
    pub scheduler: crate::retention::SchedulerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviewAggregate {
    pub to_trash: usize,
    pub to_delete: usize,
    pub folders_affected: usize,
    pub per_account: HashMap<String, PreviewReport>,
}

/// Wires the fleet registry, the retention subsystem, and a standalone IMAP
/// connector (for trash/inbox reads that should not borrow a processor's
/// in-flight connection) behind the operations `EXTERNAL INTERFACES`
/// describes. Constructed once at process start, alongside the task manager
/// and retention scheduler it wraps, and handed to the HTTP layer.
pub struct ControlPlane {
    tasks: Arc<TaskManager>,
    scheduler: Arc<RetentionScheduler>,
    retention: Arc<RetentionManager>,
    policies: Arc<PolicyStore>,
    audit: Arc<AuditLog>,
    connector: Arc<dyn ImapConnector>,
}

impl ControlPlane {
    pub fn new(
        tasks: Arc<TaskManager>,
        scheduler: Arc<RetentionScheduler>,
        retention: Arc<RetentionManager>,
        policies: Arc<PolicyStore>,
        audit: Arc<AuditLog>,
        connector: Arc<dyn ImapConnector>,
    ) -> Self {
        Self {
            tasks,
            scheduler,
            retention,
            policies,
            audit,
            connector,
        }
    }

    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            accounts: self.tasks.system_status().await,
            scheduler: self.scheduler.stats_snapshot().await,
        }
    }

    pub async fn aggregate_stats(&self) -> crate::task_manager::AggregateStats {
        self.tasks.get_aggregate_stats().await
    }

    pub async fn account_status(&self, email: &str) -> Outcome<AccountStatus> {
        match self.tasks.account_status(email).await {
            Some(status) => Outcome::ok(status),
            None => Outcome::err(format!("account '{email}' not found")),
        }
    }

    pub async fn folder_status(&self, email: &str) -> Outcome<FolderStatus> {
        let Some(processor) = self.tasks.processor(email).await else {
            return Outcome::err(format!("account '{email}' not found"));
        };
        Outcome::ok(processor.folder_status().await)
    }

    pub async fn create_folders(&self, email: &str, confirm: bool) -> Outcome<FolderStatus> {
        if !confirm {
            return Outcome::err("folder creation requires explicit confirmation");
        }
        let Some(processor) = self.tasks.processor(email).await else {
            return Outcome::err(format!("account '{email}' not found"));
        };
        Outcome::from_result(processor.create_missing_folders().await)
    }

    pub async fn start(&self, email: &str, mode: ProcessorMode) -> Outcome<()> {
        Outcome::from_result(self.tasks.start(email, mode).await)
    }

    pub async fn stop(&self, email: &str) -> Outcome<()> {
        Outcome::from_result(self.tasks.stop(email).await)
    }

    pub async fn restart(&self, email: &str) -> Outcome<()> {
        Outcome::from_result(self.tasks.restart(email).await)
    }

    pub async fn switch_mode(&self, email: &str, mode: ProcessorMode) -> Outcome<()> {
        Outcome::from_result(self.tasks.switch_mode(email, mode).await)
    }

    /// Only meaningful while the account's processor is in startup mode;
    /// the processor itself rejects the call otherwise.
    pub async fn process_batch(&self, email: &str, limit: usize) -> Outcome<BatchReport> {
        let Some(processor) = self.tasks.processor(email).await else {
            return Outcome::err(format!("account '{email}' not found"));
        };
        Outcome::from_result(processor.process_batch(limit.clamp(1, 500)).await)
    }

    pub async fn inbox_count(&self, email: &str) -> Outcome<usize> {
        let Some(processor) = self.tasks.processor(email).await else {
            return Outcome::err(format!("account '{email}' not found"));
        };
        Outcome::from_result(processor.inbox_count().await)
    }

    pub async fn bulk_start(&self, mode: ProcessorMode) -> HashMap<String, Outcome<()>> {
        self.tasks
            .bulk_start(mode)
            .await
            .into_iter()
            .map(|(email, result)| (email, Outcome::from_result(result)))
            .collect()
    }

    pub async fn bulk_stop(&self) -> HashMap<String, Outcome<()>> {
        self.tasks
            .bulk_stop()
            .await
            .into_iter()
            .map(|(email, result)| (email, Outcome::from_result(result)))
            .collect()
    }

    pub async fn refresh_accounts(&self) -> Outcome<RefreshResult> {
        Outcome::from_result(
            self.tasks
                .refresh_accounts_from_config()
                .await
                .map(|(before, after)| RefreshResult { before, after }),
        )
    }

    pub async fn task_history(&self, limit: usize) -> Vec<TaskHistoryEntry> {
        self.tasks.task_history(limit).await
    }

    /// `email = None` previews every registered account and sums the
    /// result; each account's own report is still available under
    /// `per_account`.
    pub async fn retention_preview(&self, email: Option<&str>, policy_id: Option<&str>) -> Outcome<PreviewAggregate> {
        let emails: Vec<String> = match email {
            Some(e) => vec![e.to_string()],
            None => self.tasks.account_emails().await,
        };
        if emails.is_empty() {
            return Outcome::ok(PreviewAggregate::default());
        }

        let mut aggregate = PreviewAggregate::default();
        for email in emails {
            let Some(processor) = self.tasks.processor(&email).await else {
                return Outcome::err(format!("account '{email}' not found"));
            };
            let account = processor.account().await;
            match self.retention.preview(&account, policy_id).await {
                Ok(report) => {
                    aggregate.to_trash += report.to_trash;
                    aggregate.to_delete += report.to_delete;
                    aggregate.folders_affected += report.folders_affected;
                    aggregate.per_account.insert(email, report);
                }
                Err(e) => return Outcome::err(e),
            }
        }
        Outcome::ok(aggregate)
    }

    /// `email = None` runs every registered account, matching
    /// [`RetentionScheduler::run_manual`]'s own account enumeration.
    pub async fn retention_execute(
        &self,
        email: Option<&str>,
        policy_id: Option<&str>,
        stage: Option<Stage>,
        dry_run: bool,
    ) -> Outcome<Vec<StageResult>> {
        Outcome::from_result(self.scheduler.run_manual(email, policy_id, stage, dry_run).await)
    }

    pub async fn retention_audit(&self, days_back: i64) -> Outcome<AuditReport> {
        let end = chrono::Utc::now();
        let start = end - chrono::Duration::days(days_back);
        Outcome::from_result(self.audit.report(start, end).await)
    }

    pub async fn trash_contents(&self, email: &str) -> Outcome<Vec<TrashItem>> {
        let Some(processor) = self.tasks.processor(email).await else {
            return Outcome::err(format!("account '{email}' not found"));
        };
        let account = processor.account().await;
        let doc = match self.policies.load().await {
            Ok(doc) => doc,
            Err(e) => return Outcome::err(e),
        };
        let trash = TrashManager::new(&doc, &self.audit);
        let mut session = match self.connector.connect(&account).await {
            Ok(s) => s,
            Err(e) => return Outcome::err(e),
        };
        let result = trash.contents(session.as_mut(), &account).await;
        let _ = session.logout().await;
        Outcome::from_result(result)
    }

    pub async fn trash_restore(&self, email: &str, uids: &[u32], target: &str) -> Outcome<usize> {
        let Some(processor) = self.tasks.processor(email).await else {
            return Outcome::err(format!("account '{email}' not found"));
        };
        let account = processor.account().await;
        let doc = match self.policies.load().await {
            Ok(doc) => doc,
            Err(e) => return Outcome::err(e),
        };
        let trash = TrashManager::new(&doc, &self.audit);
        let mut session = match self.connector.connect(&account).await {
            Ok(s) => s,
            Err(e) => return Outcome::err(e),
        };
        let result = trash.restore(session.as_mut(), &account, uids, target).await;
        let _ = session.logout().await;
        Outcome::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Account, ConnectionOptions, ExecutionConfig};
    use crate::imap_client::ImapSession;
    use crate::lists::ListStore;
    use crate::models::{FolderInfo, MessageHeader};
    use crate::rules::RuleStore;
    use async_trait::async_trait;
    use mockall::mock;
    use std::collections::HashMap as Map;
    use tempfile::tempdir;

    mock! {
        pub Session {}
        #[async_trait]
        impl ImapSession for Session {
            async fn list_folders(&mut self) -> Result<Vec<FolderInfo>>;
            async fn select(&mut self, folder: &str) -> Result<()>;
            async fn fetch_headers(&mut self, folder: &str, limit: Option<usize>) -> Result<Vec<MessageHeader>>;
            async fn move_messages(&mut self, uids: &[u32], dest: &str) -> Result<()>;
            async fn delete_messages(&mut self, uids: &[u32]) -> Result<()>;
            async fn flag(&mut self, uids: &[u32], flag_name: &str, set: bool) -> Result<()>;
            async fn create_folder(&mut self, name: &str) -> Result<()>;
            async fn gmail_remove_label(&mut self, uid: u32, label: &str) -> Result<()>;
            async fn logout(&mut self) -> Result<()>;
        }
    }

    mock! {
        pub Connector {}
        #[async_trait]
        impl ImapConnector for Connector {
            async fn connect(&self, account: &Account) -> Result<Box<dyn ImapSession>>;
        }
    }

    fn account(email: &str) -> Account {
        Account {
            name: email.to_string(),
            email: email.to_string(),
            server: "imap.example.com".into(),
            username: email.to_string(),
            password: "x".into(),
            connection: ConnectionOptions::default(),
            folders: Map::new(),
            env_derived: false,
        }
    }

    async fn make_control(dir: &std::path::Path, connector: MockConnector) -> ControlPlane {
        let rules = Arc::new(RuleStore::new(dir.join("rules.json")));
        let lists = Arc::new(ListStore::new(dir.join("lists")));
        let policies = Arc::new(PolicyStore::new(dir.join("retention_policies.json")));
        let audit = Arc::new(AuditLog::new(dir.join("audit.log")));
        let connector: Arc<dyn ImapConnector> = Arc::new(connector);
        let retention = Arc::new(RetentionManager::new(policies.clone(), audit.clone(), connector.clone()));
        let tasks = Arc::new(TaskManager::new(
            rules,
            lists,
            policies.clone(),
            retention.clone(),
            connector.clone(),
            ExecutionConfig::default(),
            dir.join("config.toml"),
        ));
        let scheduler = Arc::new(RetentionScheduler::new(
            retention.clone(),
            policies.clone(),
            dir.join("config.toml"),
        ));
        ControlPlane::new(tasks, scheduler, retention, policies, audit, connector)
    }

    #[tokio::test]
    async fn account_status_reports_not_found_as_error_outcome() {
        let dir = tempdir().unwrap();
        let control = make_control(dir.path(), MockConnector::new()).await;
        let outcome = control.account_status("ghost@example.com").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn start_then_status_roundtrips_through_task_manager() {
        let dir = tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_list_folders().returning(|| Ok(vec![]));
            session.expect_create_folder().returning(|_| Ok(()));
            session.expect_logout().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ImapSession>)
        });
        let control = make_control(dir.path(), connector).await;
        control.tasks.add_account(account("a@example.com")).await.unwrap();

        let outcome = control.start("a@example.com", ProcessorMode::Startup).await;
        assert!(outcome.success);

        let status = control.account_status("a@example.com").await;
        assert!(status.success);
        assert_eq!(status.data.unwrap().state, crate::processor::ProcessorState::RunningStartup);
    }

    #[tokio::test]
    async fn create_folders_requires_confirmation() {
        let dir = tempdir().unwrap();
        let control = make_control(dir.path(), MockConnector::new()).await;
        control.tasks.add_account(account("a@example.com")).await.unwrap();
        let outcome = control.create_folders("a@example.com", false).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn aggregate_stats_reflects_registered_accounts() {
        let dir = tempdir().unwrap();
        let control = make_control(dir.path(), MockConnector::new()).await;
        assert_eq!(control.aggregate_stats().await.total_accounts, 0);
        control.tasks.add_account(account("a@example.com")).await.unwrap();
        assert_eq!(control.aggregate_stats().await.total_accounts, 1);
    }
}
