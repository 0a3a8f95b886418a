//! Rule store and evaluator.
//!
//! Rules are persisted as a JSON array, atomically written. Condition and
//! action kinds are closed sets, modeled as tagged enums so the compiler
//! enforces exhaustive handling in [`matches`] and the processor's action
//! dispatch — the on-disk string tags match what a pre-existing consumer
//! would already expect (`"sender_contains"`, `"move_to_folder"`, ...).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::lists::ListStore;
use crate::models::MessageHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    SenderContains { value: String, case_sensitive: bool },
    SenderDomainEquals { value: String, case_sensitive: bool },
    SenderExact { value: String, case_sensitive: bool },
    SubjectContains { value: String, case_sensitive: bool },
    SubjectExact { value: String, case_sensitive: bool },
    SubjectRegex { value: String, case_sensitive: bool },
    ContentContains { value: String, case_sensitive: bool },
    SenderInNamedList { value: String, case_sensitive: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    MoveToFolder {
        target: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retention_days: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trash_retention_days: Option<i64>,
        #[serde(default)]
        skip_trash: bool,
    },
    AddSenderToList {
        target: String,
    },
    CreateList {
        target: String,
    },
    MarkRead,
    SetRetention {
        retention_days: i64,
        trash_retention_days: i64,
        #[serde(default)]
        skip_trash: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Empty means "applies to every account".
    #[serde(default)]
    pub account_email: String,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub condition_logic: ConditionLogic,
    pub priority: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        conditions: Vec<Condition>,
        actions: Vec<Action>,
        condition_logic: ConditionLogic,
        priority: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            account_email: String::new(),
            conditions,
            actions,
            condition_logic,
            priority,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if this rule applies to `account_email` (empty scope = all accounts).
    pub fn applies_to(&self, account_email: &str) -> bool {
        self.account_email.is_empty() || self.account_email == account_email
    }

    /// True if any action is, or carries the parameters of, a retention action.
    pub fn has_retention_actions(&self) -> bool {
        self.actions.iter().any(|a| {
            matches!(
                a,
                Action::SetRetention { .. }
                    | Action::MoveToFolder {
                        retention_days: Some(_),
                        ..
                    }
            )
        })
    }

    /// The first action's retention tuple, `(retention_days, trash_retention_days,
    /// skip_trash, folder)`, if this rule carries retention parameters.
    pub fn retention_settings(&self) -> Option<(i64, i64, bool, Option<String>)> {
        for action in &self.actions {
            match action {
                Action::SetRetention {
                    retention_days,
                    trash_retention_days,
                    skip_trash,
                } => return Some((*retention_days, *trash_retention_days, *skip_trash, None)),
                Action::MoveToFolder {
                    target,
                    retention_days: Some(days),
                    trash_retention_days,
                    skip_trash,
                } => {
                    return Some((
                        *days,
                        trash_retention_days.unwrap_or(7),
                        *skip_trash,
                        Some(target.clone()),
                    ))
                }
                _ => continue,
            }
        }
        None
    }
}

/// Evaluates conditions against a message. `content` is empty in every
/// current headers-only pipeline, so `content_contains` never matches today.
pub fn matches(rule: &Rule, message: &MessageHeader, content: &str, lists: Option<&[String]>) -> bool {
    if !rule.active || rule.conditions.is_empty() {
        return false;
    }

    let mut results = rule.conditions.iter().map(|c| eval_condition(c, message, content, lists));

    match rule.condition_logic {
        ConditionLogic::And => results.all(|r| r),
        ConditionLogic::Or => results.any(|r| r),
    }
}

fn eval_condition(condition: &Condition, message: &MessageHeader, content: &str, lists: Option<&[String]>) -> bool {
    match condition {
        Condition::SenderContains { value, case_sensitive } => {
            contains(&message.sender, value, *case_sensitive)
        }
        Condition::SenderExact { value, case_sensitive } => {
            equals(message.sender_address(), value, *case_sensitive)
        }
        Condition::SenderDomainEquals { value, case_sensitive } => {
            equals(&message.sender_domain(), value, *case_sensitive)
        }
        Condition::SubjectContains { value, case_sensitive } => {
            contains(&message.subject, value, *case_sensitive)
        }
        Condition::SubjectExact { value, case_sensitive } => {
            equals(&message.subject, value, *case_sensitive)
        }
        Condition::SubjectRegex { value, case_sensitive } => {
            match RegexBuilder::new(value).case_insensitive(!case_sensitive).build() {
                Ok(re) => re.is_match(&message.subject),
                Err(_) => false,
            }
        }
        Condition::ContentContains { value, case_sensitive } => contains(content, value, *case_sensitive),
        Condition::SenderInNamedList { value: _, case_sensitive } => {
            let addr = message.sender_address();
            match lists {
                Some(addrs) => addrs.iter().any(|a| {
                    equals(crate::models::extract_address(a), addr, *case_sensitive)
                }),
                None => false,
            }
        }
    }
}

fn contains(haystack: &str, needle: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        haystack.contains(needle)
    } else {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    }
}

fn equals(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

/// The named list `sender_in_named_list` needs is resolved by the caller
/// (processor/retention manager) via the [`ListStore`], since rule
/// evaluation itself has no I/O. This helper is the glue the caller uses.
pub async fn resolve_named_list(condition: &Condition, lists: &ListStore) -> Result<Option<Vec<String>>> {
    if let Condition::SenderInNamedList { value, .. } = condition {
        match lists.read(value).await {
            Ok(addrs) => Ok(Some(addrs)),
            Err(e) => {
                tracing::warn!(list = %value, error = %e, "failed to read named list, treating as empty");
                Ok(Some(Vec::new()))
            }
        }
    } else {
        Ok(None)
    }
}

/// Persistent, priority-ordered collection of rules with atomic writes.
pub struct RuleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<Vec<Rule>> {
        let _guard = self.lock.lock().await;
        self.load_locked().await
    }

    async fn load_locked(&self) -> Result<Vec<Rule>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_locked(&self, rules: &[Rule]) -> Result<()> {
        let content = serde_json::to_string_pretty(rules)?;
        crate::atomic::write_atomic(&self.path, content.as_bytes()).await
    }

    pub async fn save(&self, rules: &[Rule]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save_locked(rules).await
    }

    pub async fn add(&self, rule: Rule) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rules = self.load_locked().await?;
        rules.push(rule);
        self.save_locked(&rules).await
    }

    pub async fn update(&self, id: &str, rule: Rule) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut rules = self.load_locked().await?;
        match rules.iter_mut().find(|r| r.id == id) {
            Some(slot) => {
                *slot = rule;
                self.save_locked(&rules).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut rules = self.load_locked().await?;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        let removed = rules.len() != before;
        if removed {
            self.save_locked(&rules).await?;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Rule>> {
        let rules = self.load().await?;
        Ok(rules.into_iter().find(|r| r.id == id))
    }

    /// All rules sorted ascending by priority (ties broken by id for
    /// determinism across repeated loads).
    pub async fn all(&self) -> Result<Vec<Rule>> {
        let mut rules = self.load().await?;
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(rules)
    }

    /// Active rules scoped to `account_email` (or unscoped), priority order.
    pub async fn active_for_account(&self, account_email: &str) -> Result<Vec<Rule>> {
        let rules = self.all().await?;
        Ok(rules
            .into_iter()
            .filter(|r| r.active && r.applies_to(account_email))
            .collect())
    }
}

pub type SharedRuleStore = Arc<RuleStore>;
