//! Trash manager: provider-aware trash folder resolution, move-to-trash,
//! restore, and age-based permanent purge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Account;
use crate::error::{MailRulezError, Result};
use crate::imap_client::{self, ImapSession};
use crate::models::MessageHeader;

use super::audit::{AuditEntry, AuditLog, OperationType};
use super::policy::PolicyDocument;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashItem {
    pub uid: u32,
    pub account_email: String,
    pub subject: String,
    pub sender: String,
    pub moved_to_trash_date: DateTime<Utc>,
    #[serde(default)]
    pub original_folder: Option<String>,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub scheduled_deletion_date: Option<DateTime<Utc>>,
}

impl TrashItem {
    pub fn days_in_trash(&self) -> i64 {
        (Utc::now() - self.moved_to_trash_date).num_days()
    }

    pub fn days_until_deletion(&self) -> Option<i64> {
        self.scheduled_deletion_date
            .map(|d| (d - Utc::now()).num_days())
    }

    pub fn is_scheduled_for_deletion(&self) -> bool {
        self.scheduled_deletion_date
            .map(|d| d <= Utc::now())
            .unwrap_or(false)
    }
}

fn provider_for(email: &str) -> &'static str {
    let lower = email.to_lowercase();
    if lower.ends_with("@gmail.com") || lower.ends_with("@googlemail.com") {
        "gmail"
    } else if lower.ends_with("@outlook.com") || lower.ends_with("@hotmail.com") || lower.ends_with("@live.com") {
        "outlook"
    } else if lower.ends_with("@yahoo.com") {
        "yahoo"
    } else if lower.ends_with("@icloud.com") || lower.ends_with("@me.com") {
        "icloud"
    } else {
        "default"
    }
}

pub struct TrashManager<'a> {
    pub policies: &'a PolicyDocument,
    pub audit: &'a AuditLog,
}

impl<'a> TrashManager<'a> {
    pub fn new(policies: &'a PolicyDocument, audit: &'a AuditLog) -> Self {
        Self { policies, audit }
    }

    /// Resolve the trash folder for `account`: explicit config override,
    /// else provider detection intersected with the server's actual
    /// folders, else the first default pattern.
    pub async fn trash_folder(&self, account: &Account, session: &mut dyn ImapSession) -> Result<String> {
        if let Some(configured) = account.folder("trash") {
            return Ok(configured.to_string());
        }

        let provider = provider_for(&account.email);
        let pattern = self
            .policies
            .trash_folder_for_provider(provider)
            .or_else(|| self.policies.trash_folder_for_provider("default"));

        let Some(pattern) = pattern else {
            return Err(MailRulezError::TrashFolderNotFound {
                account: account.email.clone(),
            });
        };

        match session.list_folders().await {
            Ok(folders) => {
                if folders.iter().any(|f| f.name == pattern) {
                    Ok(pattern.to_string())
                } else {
                    // fall back to the pattern even if not observed on the
                    // server listing; IMAP LIST can omit special-use folders
                    Ok(pattern.to_string())
                }
            }
            Err(_) => Ok(pattern.to_string()),
        }
    }

    /// Moves `uids` from `source` into the account's trash folder. Always
    /// produces a `trash_operation` audit entry, success or failure.
    pub async fn move_to_trash(
        &self,
        session: &mut dyn ImapSession,
        uids: &[u32],
        source: &str,
        account: &Account,
        policy_id: Option<&str>,
    ) -> Result<usize> {
        if uids.is_empty() {
            return Ok(0);
        }
        let trash = self.trash_folder(account, session).await?;
        let correlated: Vec<u32> = uids.iter().take(10).copied().collect();

        let outcome = imap_client::move_messages_for_account(session, account, uids, source, &trash).await;

        let (moved, error) = match &outcome {
            Ok(result) => (result.moved, None),
            Err(e) => (0, Some(e.to_string())),
        };

        self.audit
            .log(AuditEntry::new(
                OperationType::TrashOperation,
                policy_id,
                serde_json::json!({
                    "account_email": account.email,
                    "policy_id": policy_id,
                    "source_folder": source,
                    "trash_folder": trash,
                    "uid_sample": correlated,
                    "moved": moved,
                    "error": error,
                }),
            ))
            .await?;

        match outcome {
            Ok(result) => Ok(result.moved),
            Err(e) => Err(e),
        }
    }

    /// Fetches trash-folder headers and synthesizes trash items.
    /// `moved_to_trash_date` defaults to the message's own date, since there
    /// is no side-channel record of when a message actually landed in trash.
    pub async fn contents(&self, session: &mut dyn ImapSession, account: &Account) -> Result<Vec<TrashItem>> {
        let trash = self.trash_folder(account, session).await?;
        let headers = session.fetch_headers(&trash, None).await?;
        Ok(headers
            .into_iter()
            .map(|h| TrashItem {
                uid: h.uid,
                account_email: account.email.clone(),
                subject: h.subject,
                sender: h.sender,
                moved_to_trash_date: h.date,
                original_folder: None,
                policy_id: None,
                scheduled_deletion_date: None,
            })
            .collect())
    }

    pub async fn restore(
        &self,
        session: &mut dyn ImapSession,
        account: &Account,
        uids: &[u32],
        target: &str,
    ) -> Result<usize> {
        let trash = self.trash_folder(account, session).await?;
        let outcome = imap_client::move_messages_for_account(session, account, uids, &trash, target).await?;
        Ok(outcome.moved)
    }

    /// Deletes the given UIDs, or (when `days_old` is given) fetches trash,
    /// filters to messages older than `days_old`, and deletes those.
    pub async fn permanent_delete(
        &self,
        session: &mut dyn ImapSession,
        account: &Account,
        uids: Option<&[u32]>,
        days_old: Option<i64>,
    ) -> Result<usize> {
        let targets: Vec<u32> = match (uids, days_old) {
            (Some(uids), _) => uids.to_vec(),
            (None, Some(days)) => {
                let cutoff = Utc::now() - chrono::Duration::days(days);
                let items = self.contents(session, account).await?;
                items
                    .into_iter()
                    .filter(|i| i.moved_to_trash_date < cutoff)
                    .map(|i| i.uid)
                    .collect()
            }
            (None, None) => {
                return Err(MailRulezError::TrashOperationError {
                    message: "permanent_delete requires either uids or days_old".to_string(),
                })
            }
        };

        if targets.is_empty() {
            return Ok(0);
        }

        session.delete_messages(&targets).await?;
        Ok(targets.len())
    }

    pub async fn cleanup_old_trash(
        &self,
        session: &mut dyn ImapSession,
        account: &Account,
        days: i64,
    ) -> Result<usize> {
        self.permanent_delete(session, account, None, Some(days)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap_client::ImapSession;
    use crate::models::{FolderInfo, MessageHeader};
    use async_trait::async_trait;
    use chrono::TimeZone;
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

    fn account(email: &str) -> Account {
        Account {
            name: "t".into(),
            email: email.into(),
            server: "imap.example.com".into(),
            username: email.into(),
            password: "x".into(),
            connection: Default::default(),
            folders: Default::default(),
            env_derived: false,
        }
    }

    #[test]
    fn provider_detection_matches_known_domains() {
        assert_eq!(provider_for("a@gmail.com"), "gmail");
        assert_eq!(provider_for("a@outlook.com"), "outlook");
        assert_eq!(provider_for("a@yahoo.com"), "yahoo");
        assert_eq!(provider_for("a@icloud.com"), "icloud");
        assert_eq!(provider_for("a@other.com"), "default");
    }

    #[tokio::test]
    async fn trash_folder_uses_configured_override() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let doc = PolicyDocument::default();
        let manager = TrashManager::new(&doc, &audit);
        let mut acct = account("a@example.com");
        acct.folders.insert("trash".into(), "My/Trash".into());
        let mut session = MockSession::new();
        session.expect_list_folders().times(0);
        let trash = manager.trash_folder(&acct, &mut session).await.unwrap();
        assert_eq!(trash, "My/Trash");
    }

    #[tokio::test]
    async fn trash_folder_falls_back_to_provider_pattern() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let doc = PolicyDocument::default();
        let manager = TrashManager::new(&doc, &audit);
        let acct = account("a@gmail.com");
        let mut session = MockSession::new();
        session.expect_list_folders().returning(|| Ok(vec![]));
        let trash = manager.trash_folder(&acct, &mut session).await.unwrap();
        assert_eq!(trash, "[Gmail]/Trash");
    }

    #[tokio::test]
    async fn move_to_trash_audits_success() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let doc = PolicyDocument::default();
        let manager = TrashManager::new(&doc, &audit);
        let acct = account("a@example.com");
        let mut session = MockSession::new();
        session.expect_move_messages().returning(|_, _| Ok(()));

        let moved = manager
            .move_to_trash(&mut session, &[1, 2, 3], "INBOX.Junk", &acct, Some("p1"))
            .await
            .unwrap();
        assert_eq!(moved, 3);

        let entries = audit.query(&Default::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation_type, OperationType::TrashOperation);
    }

    #[tokio::test]
    async fn move_to_trash_audits_failure_too() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let doc = PolicyDocument::default();
        let manager = TrashManager::new(&doc, &audit);
        let acct = account("a@example.com");
        let mut session = MockSession::new();
        session.expect_move_messages().returning(|_, _| {
            Err(MailRulezError::MoveError {
                count: 1,
                dest: "Trash".into(),
                message: "nope".into(),
            })
        });

        let result = manager
            .move_to_trash(&mut session, &[1], "INBOX.Junk", &acct, None)
            .await;
        assert!(result.is_err());

        let entries = audit.query(&Default::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn permanent_delete_by_days_old_filters_trash_contents() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let doc = PolicyDocument::default();
        let manager = TrashManager::new(&doc, &audit);
        let acct = account("a@example.com");
        let mut session = MockSession::new();
        session.expect_list_folders().returning(|| Ok(vec![]));
        session.expect_fetch_headers().returning(|_, _| {
            Ok(vec![
                MessageHeader {
                    uid: 1,
                    subject: "old".into(),
                    sender: "x@y.com".into(),
                    date: Utc::now() - chrono::Duration::days(40),
                },
                MessageHeader {
                    uid: 2,
                    subject: "new".into(),
                    sender: "x@y.com".into(),
                    date: Utc::now() - chrono::Duration::days(1),
                },
            ])
        });
        session
            .expect_delete_messages()
            .withf(|uids| uids == [1])
            .times(1)
            .returning(|_| Ok(()));

        let deleted = manager.cleanup_old_trash(&mut session, &acct, 7).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn permanent_delete_on_empty_trash_is_a_noop() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let doc = PolicyDocument::default();
        let manager = TrashManager::new(&doc, &audit);
        let acct = account("a@example.com");
        let mut session = MockSession::new();
        session.expect_list_folders().returning(|| Ok(vec![]));
        session.expect_fetch_headers().returning(|_, _| Ok(vec![]));
        session.expect_delete_messages().times(0);

        let deleted = manager.cleanup_old_trash(&mut session, &acct, 7).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn trash_item_derives_age_fields() {
        let item = TrashItem {
            uid: 1,
            account_email: "a@b.com".into(),
            subject: "s".into(),
            sender: "x@y.com".into(),
            moved_to_trash_date: Utc::now() - chrono::Duration::days(5),
            original_folder: None,
            policy_id: None,
            scheduled_deletion_date: Some(Utc::now() - chrono::Duration::minutes(1)),
        };
        assert_eq!(item.days_in_trash(), 5);
        assert!(item.is_scheduled_for_deletion());
    }
}
