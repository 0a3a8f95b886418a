//! Retention policy store: folder-scoped and rule-scoped policies, global
//! settings, and the provider trash-folder table, all in one atomically
//! written JSON document.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MailRulezError, Result};

pub const DEFAULT_MIN_RETENTION_DAYS: i64 = 1;
pub const DEFAULT_MAX_EMAILS_PER_OPERATION: usize = 1000;
pub const DEFAULT_TRASH_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub retention_days: i64,
    pub trash_retention_days: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub skip_trash: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_applied: Option<DateTime<Utc>>,
    #[serde(default)]
    pub moves_count: u64,
    #[serde(default)]
    pub deletions_count: u64,
}

fn default_true() -> bool {
    true
}

impl RetentionPolicy {
    pub fn total_lifecycle_days(&self) -> i64 {
        if self.skip_trash {
            self.retention_days
        } else {
            self.retention_days + self.trash_retention_days
        }
    }

    pub fn is_folder_policy(&self) -> bool {
        self.folder_pattern.is_some()
    }
}

/// Every boundary invariant a policy must satisfy before it can be persisted.
pub fn validate_policy(policy: &RetentionPolicy, min_retention_days: i64) -> Result<()> {
    if policy.retention_days < min_retention_days {
        return Err(MailRulezError::InvalidRetentionPeriod {
            days: policy.retention_days,
            minimum: min_retention_days,
        });
    }
    if policy.trash_retention_days < 1 {
        return Err(MailRulezError::PolicyValidation {
            message: "trash_retention_days must be at least 1".into(),
        });
    }
    match (&policy.folder_pattern, &policy.rule_id) {
        (Some(_), None) | (None, Some(_)) => Ok(()),
        (Some(_), Some(_)) => Err(MailRulezError::PolicyValidation {
            message: "policy cannot target both a folder and a rule".into(),
        }),
        (None, None) => Err(MailRulezError::PolicyValidation {
            message: "policy must target either a folder or a rule".into(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_min_retention")]
    pub min_retention_days: i64,
    #[serde(default = "default_max_emails")]
    pub max_emails_per_operation: usize,
    #[serde(default = "default_trash_retention")]
    pub default_trash_retention_days: i64,
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
    #[serde(default = "default_scheduler_hour")]
    pub scheduler_hour: u8,
    #[serde(default = "default_audit_retention")]
    pub audit_retention_days: i64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            min_retention_days: default_min_retention(),
            max_emails_per_operation: default_max_emails(),
            default_trash_retention_days: default_trash_retention(),
            scheduler_enabled: true,
            scheduler_hour: default_scheduler_hour(),
            audit_retention_days: default_audit_retention(),
        }
    }
}

fn default_min_retention() -> i64 {
    DEFAULT_MIN_RETENTION_DAYS
}
fn default_max_emails() -> usize {
    DEFAULT_MAX_EMAILS_PER_OPERATION
}
fn default_trash_retention() -> i64 {
    DEFAULT_TRASH_RETENTION_DAYS
}
fn default_scheduler_hour() -> u8 {
    2
}
fn default_audit_retention() -> i64 {
    90
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_hour > 23 {
            return Err(MailRulezError::ConfigValidation(vec![format!(
                "scheduler_hour {} is out of range [0,23]",
                self.scheduler_hour
            )]));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub folder_policies: HashMap<String, RetentionPolicy>,
    #[serde(default)]
    pub rule_policies: HashMap<String, RetentionPolicy>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
    #[serde(default = "default_trash_folders")]
    pub trash_folders: HashMap<String, String>,
    /// Preserves JSON-array insertion order for deterministic
    /// applicable-policy iteration.
    #[serde(default)]
    pub folder_policy_order: Vec<String>,
}

fn default_trash_folders() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("gmail".to_string(), "[Gmail]/Trash".to_string());
    map.insert("outlook".to_string(), "Deleted Items".to_string());
    map.insert("yahoo".to_string(), "Trash".to_string());
    map.insert("icloud".to_string(), "Deleted Messages".to_string());
    map.insert("default".to_string(), "Trash".to_string());
    map
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            folder_policies: HashMap::new(),
            rule_policies: HashMap::new(),
            global_settings: GlobalSettings::default(),
            trash_folders: default_trash_folders(),
            folder_policy_order: Vec::new(),
        }
    }
}

impl PolicyDocument {
    /// Three defaults minted on first run when no policy file exists yet.
    pub fn bootstrap_defaults() -> Self {
        let mut doc = PolicyDocument::default();
        let now = Utc::now();
        let defaults = [
            ("approved_ads", 30, 7),
            ("junk", 7, 7),
            ("processed", 90, 7),
        ];
        for (folder, retention_days, trash_retention_days) in defaults {
            let id = Uuid::new_v4().to_string();
            doc.folder_policies.insert(
                id.clone(),
                RetentionPolicy {
                    id: id.clone(),
                    name: format!("Default {folder} retention"),
                    description: format!("Bootstrapped default policy for '{folder}'"),
                    retention_days,
                    trash_retention_days,
                    folder_pattern: Some(folder.to_string()),
                    rule_id: None,
                    skip_trash: false,
                    active: true,
                    created_at: now,
                    updated_at: now,
                    last_applied: None,
                    moves_count: 0,
                    deletions_count: 0,
                },
            );
            doc.folder_policy_order.push(id);
        }
        doc
    }

    /// One-shot migration of a legacy `{folder_type: days}` mapping into
    /// minted policies with `trash_retention_days = 7`.
    pub fn migrate_legacy(legacy: HashMap<String, i64>) -> Self {
        let mut doc = PolicyDocument::default();
        let now = Utc::now();
        for (folder, days) in legacy {
            let id = Uuid::new_v4().to_string();
            doc.folder_policies.insert(
                id.clone(),
                RetentionPolicy {
                    id: id.clone(),
                    name: format!("Migrated {folder} retention"),
                    description: "Migrated from legacy folder_type->days mapping".to_string(),
                    retention_days: days,
                    trash_retention_days: 7,
                    folder_pattern: Some(folder),
                    rule_id: None,
                    skip_trash: false,
                    active: true,
                    created_at: now,
                    updated_at: now,
                    last_applied: None,
                    moves_count: 0,
                    deletions_count: 0,
                },
            );
            doc.folder_policy_order.push(id);
        }
        doc
    }

    pub fn by_id(&self, id: &str) -> Option<&RetentionPolicy> {
        self.folder_policies.get(id).or_else(|| self.rule_policies.get(id))
    }

    pub fn by_rule_id(&self, rule_id: &str) -> Option<&RetentionPolicy> {
        self.rule_policies.values().find(|p| p.rule_id.as_deref() == Some(rule_id))
    }

    /// Active folder policies whose pattern substring- or suffix-matches
    /// `folder`, case-insensitively, in store (insertion) order.
    pub fn applicable_folder_policies(&self, folder: &str) -> Vec<&RetentionPolicy> {
        let folder_lower = folder.to_lowercase();
        self.folder_policy_order
            .iter()
            .filter_map(|id| self.folder_policies.get(id))
            .filter(|p| p.active)
            .filter(|p| {
                p.folder_pattern
                    .as_ref()
                    .map(|pattern| {
                        let pattern_lower = pattern.to_lowercase();
                        folder_lower.contains(&pattern_lower) || folder_lower.ends_with(&pattern_lower)
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn trash_folder_for_provider(&self, provider: &str) -> Option<&str> {
        self.trash_folders.get(provider).map(|s| s.as_str())
    }
}

pub struct PolicyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<PolicyDocument> {
        let _guard = self.lock.lock().await;
        self.load_locked().await
    }

    async fn load_locked(&self) -> Result<PolicyDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let doc = PolicyDocument::bootstrap_defaults();
                self.save_locked(&doc).await?;
                Ok(doc)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_locked(&self, doc: &PolicyDocument) -> Result<()> {
        let content = serde_json::to_string_pretty(doc)?;
        crate::atomic::write_atomic(&self.path, content.as_bytes()).await
    }

    pub async fn save(&self, doc: &PolicyDocument) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save_locked(doc).await
    }

    pub async fn upsert_folder_policy(&self, policy: RetentionPolicy) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_locked().await?;
        validate_policy(&policy, doc.global_settings.min_retention_days)?;
        if !doc.folder_policies.contains_key(&policy.id) {
            doc.folder_policy_order.push(policy.id.clone());
        }
        doc.folder_policies.insert(policy.id.clone(), policy);
        self.save_locked(&doc).await
    }

    pub async fn upsert_rule_policy(&self, policy: RetentionPolicy) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_locked().await?;
        validate_policy(&policy, doc.global_settings.min_retention_days)?;
        doc.rule_policies.insert(policy.id.clone(), policy);
        self.save_locked(&doc).await
    }

    pub async fn record_outcome(&self, policy_id: &str, moved: u64, deleted: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_locked().await?;
        let now = Utc::now();
        if let Some(p) = doc.folder_policies.get_mut(policy_id) {
            p.moves_count += moved;
            p.deletions_count += deleted;
            p.last_applied = Some(now);
        } else if let Some(p) = doc.rule_policies.get_mut(policy_id) {
            p.moves_count += moved;
            p.deletions_count += deleted;
            p.last_applied = Some(now);
        }
        self.save_locked(&doc).await
    }

    /// Mints a rule-scoped policy for every active rule that has retention
    /// actions and no existing policy keyed to its id. Idempotent.
    pub async fn ensure_policies_from_rules(&self, rules: &[crate::rules::Rule]) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_locked().await?;
        let mut created = 0;
        for rule in rules {
            if !rule.has_retention_actions() || doc.by_rule_id(&rule.id).is_some() {
                continue;
            }
            let Some((retention_days, trash_retention_days, skip_trash, _folder)) =
                rule.retention_settings()
            else {
                continue;
            };
            let now = Utc::now();
            let id = Uuid::new_v4().to_string();
            doc.rule_policies.insert(
                id.clone(),
                RetentionPolicy {
                    id,
                    name: format!("Auto-policy for rule '{}'", rule.name),
                    description: "Created automatically from a rule's retention action".to_string(),
                    retention_days,
                    trash_retention_days,
                    folder_pattern: None,
                    rule_id: Some(rule.id.clone()),
                    skip_trash,
                    active: true,
                    created_at: now,
                    updated_at: now,
                    last_applied: None,
                    moves_count: 0,
                    deletions_count: 0,
                },
            );
            created += 1;
        }
        if created > 0 {
            self.save_locked(&doc).await?;
        }
        Ok(created)
    }
}
