//! Retention manager: orchestrates the two-stage lifecycle (move-to-trash,
//! then permanent delete) over a single account's active policies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

use crate::config::Account;
use crate::error::{MailRulezError, Result};
use crate::imap_client::ImapConnector;

use super::audit::{AuditEntry, AuditLog, OperationType};
use super::policy::{PolicyDocument, PolicyStore, RetentionPolicy};
use super::trash::TrashManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MoveToTrash,
    PermanentDelete,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub policy_id: Option<String>,
    pub stage: Stage,
    pub success: bool,
    pub affected: usize,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviewRow {
    pub policy_id: String,
    pub folder_pattern: Option<String>,
    pub to_trash: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviewReport {
    pub to_trash: usize,
    pub to_delete: usize,
    pub folders_affected: usize,
    pub rows: Vec<PreviewRow>,
}

pub struct RetentionManager {
    policies: Arc<PolicyStore>,
    audit: Arc<AuditLog>,
    connector: Arc<dyn ImapConnector>,
}

impl RetentionManager {
    pub fn new(policies: Arc<PolicyStore>, audit: Arc<AuditLog>, connector: Arc<dyn ImapConnector>) -> Self {
        Self {
            policies,
            audit,
            connector,
        }
    }

    /// Moves every message older than `policy.retention_days` in the policy's
    /// source folder into the account's trash, capped at
    /// `global_settings.max_emails_per_operation`. `dry_run` reports the
    /// selection size without moving anything.
    pub async fn stage1_move_to_trash(
        &self,
        account: &Account,
        policy: &RetentionPolicy,
        doc: &PolicyDocument,
        folder_override: Option<&str>,
        dry_run: bool,
    ) -> Result<StageResult> {
        let start = Instant::now();
        let source = folder_override
            .map(|s| s.to_string())
            .or_else(|| policy.folder_pattern.clone());

        let Some(source) = source else {
            let message = "policy has no folder_pattern and no override was given".to_string();
            self.audit_stage1(account, policy, None, false, 0, Some(&message)).await?;
            return Err(MailRulezError::RetentionExecutionError {
                stage: "stage1".into(),
                message,
            });
        };

        let result = self.run_stage1(account, policy, doc, &source, dry_run).await;
        let elapsed = start.elapsed();

        match result {
            Ok(affected) => {
                self.audit_stage1(account, policy, Some(&source), true, affected, None).await?;
                Ok(StageResult {
                    policy_id: Some(policy.id.clone()),
                    stage: Stage::MoveToTrash,
                    success: true,
                    affected,
                    duration: elapsed,
                    error: None,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.audit_stage1(account, policy, Some(&source), false, 0, Some(&message)).await?;
                Err(MailRulezError::RetentionExecutionError {
                    stage: "stage1".into(),
                    message,
                })
            }
        }
    }

    async fn run_stage1(
        &self,
        account: &Account,
        policy: &RetentionPolicy,
        doc: &PolicyDocument,
        source: &str,
        dry_run: bool,
    ) -> Result<usize> {
        let mut session = self.connector.connect(account).await?;
        let headers = session.fetch_headers(source, None).await?;

        let cutoff = Utc::now() - chrono::Duration::days(policy.retention_days);
        let mut candidates: Vec<u32> = headers
            .iter()
            .filter(|h| h.date < cutoff)
            .map(|h| h.uid)
            .collect();
        candidates.sort_unstable();

        let cap = doc.global_settings.max_emails_per_operation;
        let capped = candidates.len() > cap;
        candidates.truncate(cap);

        if capped {
            warn!(
                account = %account.email,
                policy = %policy.id,
                candidates = candidates.len(),
                cap,
                "stage1 selection exceeded max_emails_per_operation, truncating"
            );
        }

        if dry_run || candidates.is_empty() {
            let _ = session.logout().await;
            return Ok(candidates.len());
        }

        let trash = TrashManager::new(doc, &self.audit);
        let moved = trash
            .move_to_trash(session.as_mut(), &candidates, source, account, Some(&policy.id))
            .await?;
        let _ = session.logout().await;

        self.policies.record_outcome(&policy.id, moved as u64, 0).await?;
        Ok(moved)
    }

    async fn audit_stage1(
        &self,
        account: &Account,
        policy: &RetentionPolicy,
        source: Option<&str>,
        success: bool,
        affected: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.audit
            .log(AuditEntry::new(
                OperationType::RetentionOperation,
                Some(&policy.id),
                serde_json::json!({
                    "stage": "stage1",
                    "account_email": account.email,
                    "policy_id": policy.id,
                    "source_folder": source,
                    "success": success,
                    "affected": affected,
                    "error": error,
                }),
            ))
            .await
    }

    /// Permanently deletes trash-folder messages older than
    /// `trash_retention_days`. `dry_run` counts without deleting.
    pub async fn stage2_permanent_delete(
        &self,
        account: &Account,
        doc: &PolicyDocument,
        trash_retention_days: i64,
        dry_run: bool,
    ) -> Result<StageResult> {
        let start = Instant::now();
        let result = self.run_stage2(account, doc, trash_retention_days, dry_run).await;
        let elapsed = start.elapsed();

        let (success, affected, error) = match &result {
            Ok(n) => (true, *n, None),
            Err(e) => (false, 0, Some(e.to_string())),
        };

        self.audit
            .log(AuditEntry::new(
                OperationType::RetentionOperation,
                None,
                serde_json::json!({
                    "stage": "stage2",
                    "account_email": account.email,
                    "trash_retention_days": trash_retention_days,
                    "dry_run": dry_run,
                    "success": success,
                    "affected": affected,
                    "error": error,
                }),
            ))
            .await?;

        match result {
            Ok(affected) => Ok(StageResult {
                policy_id: None,
                stage: Stage::PermanentDelete,
                success: true,
                affected,
                duration: elapsed,
                error: None,
            }),
            Err(e) => Err(MailRulezError::RetentionExecutionError {
                stage: "stage2".into(),
                message: e.to_string(),
            }),
        }
    }

    async fn run_stage2(
        &self,
        account: &Account,
        doc: &PolicyDocument,
        trash_retention_days: i64,
        dry_run: bool,
    ) -> Result<usize> {
        let mut session = self.connector.connect(account).await?;
        let trash = TrashManager::new(doc, &self.audit);

        if dry_run {
            let cutoff = Utc::now() - chrono::Duration::days(trash_retention_days);
            let items = trash.contents(session.as_mut(), account).await?;
            let _ = session.logout().await;
            Ok(items.into_iter().filter(|i| i.moved_to_trash_date < cutoff).count())
        } else {
            let deleted = trash
                .cleanup_old_trash(session.as_mut(), account, trash_retention_days)
                .await?;
            let _ = session.logout().await;
            Ok(deleted)
        }
    }

    /// Runs stage-1 for each active folder policy, then stage-2 once with
    /// `default_trash_retention_days`. `stage` restricts to a single stage
    /// when given.
    pub async fn run_for_account(
        &self,
        account: &Account,
        stage: Option<Stage>,
        dry_run: bool,
    ) -> Result<Vec<StageResult>> {
        let doc = self.policies.load().await?;
        let mut results = Vec::new();

        if stage.is_none() || stage == Some(Stage::MoveToTrash) {
            for id in &doc.folder_policy_order {
                let Some(policy) = doc.folder_policies.get(id) else {
                    continue;
                };
                if !policy.active {
                    continue;
                }
                match self.stage1_move_to_trash(account, policy, &doc, None, dry_run).await {
                    Ok(r) => results.push(r),
                    Err(e) => {
                        error!(account = %account.email, policy = %policy.id, error = %e, "stage1 failed");
                        results.push(StageResult {
                            policy_id: Some(policy.id.clone()),
                            stage: Stage::MoveToTrash,
                            success: false,
                            affected: 0,
                            duration: Duration::default(),
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        }

        if stage.is_none() || stage == Some(Stage::PermanentDelete) {
            let days = doc.global_settings.default_trash_retention_days;
            match self.stage2_permanent_delete(account, &doc, days, dry_run).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    error!(account = %account.email, error = %e, "stage2 failed");
                    results.push(StageResult {
                        policy_id: None,
                        stage: Stage::PermanentDelete,
                        success: false,
                        affected: 0,
                        duration: Duration::default(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(results)
    }

    /// Dry-run aggregate over one or all active folder policies, plus a
    /// dry-run stage-2 count. Uses its own connection and mutates no state,
    /// so it is safe to call while a processor is actively running.
    pub async fn preview(&self, account: &Account, policy_id: Option<&str>) -> Result<PreviewReport> {
        let doc = self.policies.load().await?;
        let mut report = PreviewReport::default();

        let targets: Vec<&RetentionPolicy> = match policy_id {
            Some(id) => doc.folder_policies.get(id).into_iter().collect(),
            None => doc
                .folder_policy_order
                .iter()
                .filter_map(|id| doc.folder_policies.get(id))
                .filter(|p| p.active)
                .collect(),
        };

        for policy in targets {
            let result = self.stage1_move_to_trash(account, policy, &doc, None, true).await?;
            report.to_trash += result.affected;
            if result.affected > 0 {
                report.folders_affected += 1;
            }
            report.rows.push(PreviewRow {
                policy_id: policy.id.clone(),
                folder_pattern: policy.folder_pattern.clone(),
                to_trash: result.affected,
            });
        }

        let stage2 = self
            .stage2_permanent_delete(account, &doc, doc.global_settings.default_trash_retention_days, true)
            .await?;
        report.to_delete = stage2.affected;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap_client::ImapSession;
    use crate::models::{FolderInfo, MessageHeader};
    use async_trait::async_trait;
    use mockall::mock;
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

    fn account() -> Account {
        Account {
            name: "t".into(),
            email: "a@example.com".into(),
            server: "imap.example.com".into(),
            username: "a@example.com".into(),
            password: "x".into(),
            connection: Default::default(),
            folders: Default::default(),
            env_derived: false,
        }
    }

    fn old_header(uid: u32, days_old: i64) -> MessageHeader {
        MessageHeader {
            uid,
            subject: "s".into(),
            sender: "x@y.com".into(),
            date: Utc::now() - chrono::Duration::days(days_old),
        }
    }

    async fn manager(dir: &std::path::Path, connector: MockConnector) -> RetentionManager {
        let policies = Arc::new(PolicyStore::new(dir.join("retention_policies.json")));
        let audit = Arc::new(AuditLog::new(dir.join("audit.log")));
        RetentionManager::new(policies, audit, Arc::new(connector))
    }

    #[tokio::test]
    async fn stage1_caps_selection_at_max_emails_per_operation() {
        let dir = tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_fetch_headers().returning(|_, _| {
                Ok((0..1500).map(|i| old_header(i, 40)).collect())
            });
            session.expect_move_messages().returning(|_, _| Ok(()));
            session.expect_logout().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ImapSession>)
        });

        let mgr = manager(dir.path(), connector).await;
        let mut doc = PolicyDocument::default();
        doc.global_settings.max_emails_per_operation = 1000;
        let policy = mgr_policy("approved_ads", 30);
        doc.folder_policy_order.push(policy.id.clone());
        doc.folder_policies.insert(policy.id.clone(), policy.clone());
        mgr.policies.save(&doc).await.unwrap();

        let result = mgr
            .stage1_move_to_trash(&account(), &policy, &doc, None, false)
            .await
            .unwrap();
        assert_eq!(result.affected, 1000);
    }

    #[tokio::test]
    async fn stage1_dry_run_moves_nothing() {
        let dir = tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_fetch_headers().returning(|_, _| Ok(vec![old_header(1, 40)]));
            session.expect_move_messages().times(0);
            session.expect_logout().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ImapSession>)
        });

        let mgr = manager(dir.path(), connector).await;
        let doc = PolicyDocument::default();
        let policy = mgr_policy("junk", 30);
        let result = mgr
            .stage1_move_to_trash(&account(), &policy, &doc, None, true)
            .await
            .unwrap();
        assert_eq!(result.affected, 1);
    }

    #[tokio::test]
    async fn stage1_skips_messages_newer_than_retention_window() {
        let dir = tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_fetch_headers().returning(|_, _| {
                Ok(vec![old_header(1, 40), old_header(2, 2)])
            });
            session.expect_move_messages().withf(|uids, _| uids == [1]).returning(|_, _| Ok(()));
            session.expect_logout().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ImapSession>)
        });

        let mgr = manager(dir.path(), connector).await;
        let doc = PolicyDocument::default();
        let policy = mgr_policy("junk", 30);
        mgr.policies.save(&doc).await.unwrap();
        let result = mgr
            .stage1_move_to_trash(&account(), &policy, &doc, None, false)
            .await
            .unwrap();
        assert_eq!(result.affected, 1);
    }

    #[tokio::test]
    async fn stage1_without_folder_pattern_or_override_errors() {
        let dir = tempdir().unwrap();
        let connector = MockConnector::new();
        let mgr = manager(dir.path(), connector).await;
        let doc = PolicyDocument::default();
        let mut policy = mgr_policy("junk", 30);
        policy.folder_pattern = None;
        policy.rule_id = Some("r1".into());
        let result = mgr.stage1_move_to_trash(&account(), &policy, &doc, None, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stage2_dry_run_counts_without_deleting() {
        let dir = tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_list_folders().returning(|| Ok(vec![]));
            session.expect_fetch_headers().returning(|_, _| Ok(vec![old_header(1, 10)]));
            session.expect_delete_messages().times(0);
            session.expect_logout().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ImapSession>)
        });

        let mgr = manager(dir.path(), connector).await;
        let doc = PolicyDocument::default();
        let result = mgr.stage2_permanent_delete(&account(), &doc, 7, true).await.unwrap();
        assert_eq!(result.affected, 1);
    }

    #[tokio::test]
    async fn preview_aggregates_to_trash_and_to_delete_without_mutating() {
        let dir = tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_list_folders().returning(|| Ok(vec![]));
            session.expect_fetch_headers().returning(|_, _| Ok(vec![old_header(1, 40)]));
            session.expect_move_messages().times(0);
            session.expect_delete_messages().times(0);
            session.expect_logout().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ImapSession>)
        });

        let mgr = manager(dir.path(), connector).await;
        let mut doc = PolicyDocument::default();
        let policy = mgr_policy("junk", 30);
        doc.folder_policy_order.push(policy.id.clone());
        doc.folder_policies.insert(policy.id.clone(), policy);
        mgr.policies.save(&doc).await.unwrap();

        let report = mgr.preview(&account(), None).await.unwrap();
        assert_eq!(report.to_trash, 1);
        assert_eq!(report.to_delete, 1);
        assert_eq!(report.folders_affected, 1);
    }

    fn mgr_policy(pattern: &str, retention_days: i64) -> RetentionPolicy {
        let now = Utc::now();
        RetentionPolicy {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("policy-{pattern}"),
            description: String::new(),
            retention_days,
            trash_retention_days: 7,
            folder_pattern: Some(pattern.to_string()),
            rule_id: None,
            skip_trash: false,
            active: true,
            created_at: now,
            updated_at: now,
            last_applied: None,
            moves_count: 0,
            deletions_count: 0,
        }
    }
}
