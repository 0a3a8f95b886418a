//! Append-only JSON-per-line audit log with query, reporting, and
//! retention-bounded rewrite (cleanup).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    RetentionOperation,
    PolicyChange,
    TrashOperation,
    AuditCleanup,
    ScheduledSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationType,
    #[serde(flatten)]
    pub fields: Value,
}

impl AuditEntry {
    pub fn new(operation_type: OperationType, policy_id: Option<&str>, fields: Value) -> Self {
        let prefix = match operation_type {
            OperationType::RetentionOperation => "ret",
            OperationType::PolicyChange => "pol",
            OperationType::TrashOperation => "trash",
            OperationType::AuditCleanup => "cleanup",
            OperationType::ScheduledSummary => "sched",
        };
        let suffix = policy_id
            .map(|id| id.chars().take(8).collect::<String>())
            .unwrap_or_else(|| "none".to_string());
        let audit_id = format!("{prefix}_{}_{suffix}", Utc::now().timestamp());
        Self {
            audit_id,
            timestamp: Utc::now(),
            operation_type,
            fields,
        }
    }
}

#[derive(Debug, Default)]
pub struct AuditFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub policy_id: Option<String>,
    pub operation_type: Option<OperationType>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(start) = self.start {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.timestamp > end {
                return false;
            }
        }
        if let Some(op) = self.operation_type {
            if entry.operation_type != op {
                return false;
            }
        }
        if let Some(policy_id) = &self.policy_id {
            let matches_field = entry
                .fields
                .get("policy_id")
                .and_then(|v| v.as_str())
                .map(|v| v == policy_id)
                .unwrap_or(false);
            if !matches_field {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default, Serialize)]
pub struct AuditReport {
    pub total_entries: usize,
    pub by_operation_type: std::collections::HashMap<String, usize>,
    pub by_policy: std::collections::HashMap<String, usize>,
    pub by_account: std::collections::HashMap<String, usize>,
    pub errors: Vec<String>,
}

pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn log(&self, entry: AuditEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let line = serde_json::to_string(&entry)?;
        crate::atomic::append_line(&self.path, &line).await
    }

    /// Parses every line, silently skipping malformed ones. Malformed lines
    /// are never rewritten on a plain read.
    async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Newest-first, bounded by `filter.limit`.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let _guard = self.lock.lock().await;
        let mut entries: Vec<AuditEntry> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub async fn report(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<AuditReport> {
        let _guard = self.lock.lock().await;
        let entries: Vec<AuditEntry> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect();

        let mut report = AuditReport {
            total_entries: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            let op_key = format!("{:?}", entry.operation_type);
            *report.by_operation_type.entry(op_key).or_insert(0) += 1;

            if let Some(policy_id) = entry.fields.get("policy_id").and_then(|v| v.as_str()) {
                *report.by_policy.entry(policy_id.to_string()).or_insert(0) += 1;
            }
            if let Some(account) = entry.fields.get("account_email").and_then(|v| v.as_str()) {
                *report.by_account.entry(account.to_string()).or_insert(0) += 1;
            }
            if let Some(error) = entry.fields.get("error").and_then(|v| v.as_str()) {
                report.errors.push(error.to_string());
            }
        }
        Ok(report)
    }

    /// Rewrites the log keeping entries within `retention_days`, plus any
    /// unparsable lines (preserved, never discarded, to avoid data loss).
    /// Goes through a temp file and atomic rename; emits its own entry.
    pub async fn cleanup(&self, retention_days: i64) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut kept_lines = Vec::new();
        let mut removed = 0;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) if entry.timestamp >= cutoff => kept_lines.push(line.to_string()),
                Ok(_) => removed += 1,
                Err(_) => kept_lines.push(line.to_string()),
            }
        }

        let mut rewritten = kept_lines.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        crate::atomic::write_atomic(&self.path, rewritten.as_bytes()).await?;

        let cleanup_entry = AuditEntry::new(
            OperationType::AuditCleanup,
            None,
            serde_json::json!({ "removed": removed, "retention_days": retention_days }),
        );
        let line = serde_json::to_string(&cleanup_entry)?;
        crate::atomic::append_line(&self.path, &line).await?;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn log_then_query_returns_entries_newest_first() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        log.log(AuditEntry::new(
            OperationType::RetentionOperation,
            Some("p1"),
            serde_json::json!({"account_email": "a@b.com"}),
        ))
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        log.log(AuditEntry::new(
            OperationType::RetentionOperation,
            Some("p1"),
            serde_json::json!({"account_email": "a@b.com"}),
        ))
        .await
        .unwrap();

        let entries = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].timestamp >= entries[1].timestamp);
    }

    #[tokio::test]
    async fn append_only_ordering_is_chronological() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        let e1 = AuditEntry::new(OperationType::TrashOperation, Some("p1"), serde_json::json!({}));
        log.log(e1.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let e2 = AuditEntry::new(OperationType::TrashOperation, Some("p1"), serde_json::json!({}));
        log.log(e2.clone()).await.unwrap();

        let entries = log
            .query(&AuditFilter {
                operation_type: Some(OperationType::TrashOperation),
                ..Default::default()
            })
            .await
            .unwrap();
        // newest-first: e2 then e1
        assert_eq!(entries[0].audit_id, e2.audit_id);
        assert_eq!(entries[1].audit_id, e1.audit_id);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_on_read_but_preserved_on_cleanup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        tokio::fs::write(&path, "not json at all\n").await.unwrap();
        let log = AuditLog::new(&path);

        let entries = log.query(&AuditFilter::default()).await.unwrap();
        assert!(entries.is_empty());

        log.cleanup(30).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("not json at all"));
    }

    #[tokio::test]
    async fn cleanup_removes_entries_older_than_retention_window() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        let mut old_entry = AuditEntry::new(OperationType::RetentionOperation, None, serde_json::json!({}));
        old_entry.timestamp = Utc::now() - chrono::Duration::days(100);
        log.log(old_entry).await.unwrap();

        let removed = log.cleanup(30).await.unwrap();
        assert_eq!(removed, 1);

        // cleanup's own entry remains
        let entries = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation_type, OperationType::AuditCleanup);
    }

    #[tokio::test]
    async fn report_aggregates_by_policy_and_account() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        log.log(AuditEntry::new(
            OperationType::RetentionOperation,
            Some("p1"),
            serde_json::json!({"policy_id": "p1", "account_email": "a@b.com"}),
        ))
        .await
        .unwrap();
        log.log(AuditEntry::new(
            OperationType::TrashOperation,
            Some("p1"),
            serde_json::json!({"policy_id": "p1", "account_email": "a@b.com", "error": "boom"}),
        ))
        .await
        .unwrap();

        let report = log
            .report(Utc::now() - chrono::Duration::days(1), Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.total_entries, 2);
        assert_eq!(report.by_policy["p1"], 2);
        assert_eq!(report.by_account["a@b.com"], 2);
        assert_eq!(report.errors, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn query_filters_by_policy_id() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        log.log(AuditEntry::new(
            OperationType::RetentionOperation,
            Some("p1"),
            serde_json::json!({"policy_id": "p1"}),
        ))
        .await
        .unwrap();
        log.log(AuditEntry::new(
            OperationType::RetentionOperation,
            Some("p2"),
            serde_json::json!({"policy_id": "p2"}),
        ))
        .await
        .unwrap();

        let entries = log
            .query(&AuditFilter {
                policy_id: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }
}
