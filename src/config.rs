//! Account and execution configuration.
//!
//! Loaded from a TOML file (one `[[accounts]]` table per mailbox plus a
//! top-level `[execution]`/`[circuit_breaker]` section) with environment
//! variables able to override or shortcut individual fields. Mirrors the
//! load/save/validate shape the rest of this crate's stores use for their
//! own JSON files, just with `toml` instead of `serde_json` at the edges.
//!
//! `MAIL_RULEZ_STRICT_VALIDATION` controls how [`AppConfig::load`] reacts to
//! a malformed account: unset (the default) drops it with a warning so the
//! rest of the fleet still starts; `true` aborts the load entirely.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{MailRulezError, Result};

/// Fixed vocabulary of folder roles a processor can provision and route
/// into. `Inbox` is always present and is never created by provisioning.
pub const FOLDER_ROLES: &[&str] = &[
    "inbox",
    "processed",
    "pending",
    "junk",
    "approved_ads",
    "headhunt",
    "packages",
    "receipts",
    "linkedin",
    "whitelist",
    "blacklist",
    "vendor",
    "headhunter",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Ssl,
    StartTls,
    None,
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::Ssl
    }
}

/// Connection options carried as a fixed record on [`Account`], replacing
/// ad-hoc dynamic attribute attachment (e.g. a bag of optional `port`/`use_ssl`
/// fields bolted on after the fact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            security: SecurityMode::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    993
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub email: String,
    pub server: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub connection: ConnectionOptions,
    /// Folder role -> provider-specific folder name, e.g. `"junk" -> "INBOX.Junk"`.
    #[serde(default)]
    pub folders: HashMap<String, String>,
    /// Set when this account was synthesized from `MAIL_RULEZ_*` env vars
    /// rather than declared in the TOML file. The retention scheduler skips
    /// these during its account enumeration.
    #[serde(default)]
    pub env_derived: bool,
}

impl Account {
    pub fn is_gmail(&self) -> bool {
        let lower = self.email.to_lowercase();
        lower.ends_with("@gmail.com") || lower.ends_with("@googlemail.com")
    }

    /// Folders this account must have provisioned: the fixed vocabulary
    /// minus `inbox`, restricted to roles the account actually maps.
    pub fn required_folders(&self) -> Vec<(&str, &str)> {
        FOLDER_ROLES
            .iter()
            .filter(|role| **role != "inbox")
            .filter_map(|role| self.folders.get(*role).map(|name| (*role, name.as_str())))
            .collect()
    }

    pub fn folder(&self, role: &str) -> Option<&str> {
        self.folders.get(role).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_training_interval_secs")]
    pub training_interval_secs: u64,
    #[serde(default = "default_consecutive_error_ceiling")]
    pub consecutive_error_ceiling: u32,
    #[serde(default = "default_stop_deadline_secs")]
    pub stop_deadline_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: default_max_concurrent_connections(),
            batch_size: default_batch_size(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            training_interval_secs: default_training_interval_secs(),
            consecutive_error_ceiling: default_consecutive_error_ceiling(),
            stop_deadline_secs: default_stop_deadline_secs(),
        }
    }
}

fn default_max_concurrent_connections() -> usize {
    5
}
fn default_batch_size() -> usize {
    200
}
fn default_maintenance_interval_secs() -> u64 {
    300
}
fn default_training_interval_secs() -> u64 {
    240
}
fn default_consecutive_error_ceiling() -> u32 {
    5
}
fn default_stop_deadline_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// IANA-ish zone name carried through for operator-facing display (e.g.
    /// audit log timestamps rendered locally); retention day-boundary math
    /// itself always runs in the scheduler's local system time. Overridden
    /// by `MAIL_RULEZ_TIMEZONE`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            execution: ExecutionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timezone: default_timezone(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Directory layout, resolved from `MAIL_RULEZ_*` environment variables
/// with sensible defaults so a bare checkout still runs.
#[derive(Debug, Clone)]
pub struct Dirs {
    pub base: PathBuf,
    pub data: PathBuf,
    pub lists: PathBuf,
    pub config: PathBuf,
    pub backups: PathBuf,
}

impl Dirs {
    pub fn from_env() -> Self {
        let base = env::var("MAIL_RULEZ_BASE_DIR")
            .or_else(|_| env::var("MAIL_RULEZ_APP_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let data = env::var("MAIL_RULEZ_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("data"));
        let lists = env::var("MAIL_RULEZ_LISTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data.join("lists"));
        let config = env::var("MAIL_RULEZ_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("config"));
        let backups = env::var("MAIL_RULEZ_BACKUPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("backups"));
        Self {
            base,
            data,
            lists,
            config,
            backups,
        }
    }
}

impl AppConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.apply_env_shortcut();
        config.apply_timezone_override();

        if Self::strict_validation_enabled() {
            config.validate()?;
        } else {
            config.prune_invalid_accounts();
            let global_errors = config.global_validation_errors();
            if !global_errors.is_empty() {
                return Err(MailRulezError::ConfigValidation(global_errors));
            }
        }
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        crate::atomic::write_atomic(path, content.as_bytes()).await?;
        Ok(())
    }

    /// `MAIL_RULEZ_SERVER`/`EMAIL`/`PASSWORD` is a single-account shortcut:
    /// when present and no account with that email is already configured,
    /// synthesize one. Accounts created this way are treated as
    /// environment-derived and are skipped by the retention scheduler's
    /// account enumeration.
    fn apply_env_shortcut(&mut self) {
        if let (Ok(server), Ok(email), Ok(password)) = (
            env::var("MAIL_RULEZ_SERVER"),
            env::var("MAIL_RULEZ_EMAIL"),
            env::var("MAIL_RULEZ_PASSWORD"),
        ) {
            if !self.accounts.iter().any(|a| a.email == email) {
                self.accounts.push(Account {
                    name: email.clone(),
                    email: email.clone(),
                    server,
                    username: email,
                    password,
                    connection: ConnectionOptions::default(),
                    folders: HashMap::new(),
                    env_derived: true,
                });
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = self.account_validation_errors();
        errors.extend(self.global_validation_errors());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MailRulezError::ConfigValidation(errors))
        }
    }

    fn account_validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for account in &self.accounts {
            errors.extend(Self::account_errors(account));
        }
        errors
    }

    fn account_errors(account: &Account) -> Vec<String> {
        let mut errors = Vec::new();
        if account.email.is_empty() {
            errors.push(format!("account '{}': email must not be empty", account.name));
        }
        if account.server.is_empty() {
            errors.push(format!("account '{}': server must not be empty", account.name));
        }
        if account.connection.port == 0 {
            errors.push(format!("account '{}': port must be non-zero", account.name));
        }
        errors
    }

    fn global_validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.execution.max_concurrent_connections == 0 {
            errors.push("execution.max_concurrent_connections must be at least 1".to_string());
        }
        if self.execution.batch_size == 0 {
            errors.push("execution.batch_size must be at least 1".to_string());
        }
        if self.execution.consecutive_error_ceiling == 0 {
            errors.push("execution.consecutive_error_ceiling must be at least 1".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        errors
    }

    /// `MAIL_RULEZ_STRICT_VALIDATION=true` makes [`AppConfig::load`] fail
    /// hard on any validation error, including a single malformed account.
    /// Unset or any other value keeps the default "graceful startup":
    /// malformed accounts are dropped (with a warning) and only structural
    /// config errors abort the load.
    fn strict_validation_enabled() -> bool {
        env::var("MAIL_RULEZ_STRICT_VALIDATION")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    /// Drops accounts that fail per-account validation, logging each one.
    /// Leaves `self.accounts` containing only accounts `account_errors`
    /// reports clean.
    fn prune_invalid_accounts(&mut self) {
        let accounts = std::mem::take(&mut self.accounts);
        self.accounts = accounts
            .into_iter()
            .filter(|account| {
                let errors = Self::account_errors(account);
                if !errors.is_empty() {
                    tracing::warn!(
                        account = %account.name,
                        errors = %errors.join("; "),
                        "dropping invalid account during graceful startup (set MAIL_RULEZ_STRICT_VALIDATION=true to fail hard instead)"
                    );
                }
                errors.is_empty()
            })
            .collect();
    }

    /// Applies `MAIL_RULEZ_TIMEZONE` over whatever the file declared,
    /// mirroring `apply_env_shortcut`'s override-if-set behavior.
    fn apply_timezone_override(&mut self) {
        if let Ok(tz) = env::var("MAIL_RULEZ_TIMEZONE") {
            self.timezone = tz;
        }
    }

    pub fn create_example() -> Self {
        let mut folders = HashMap::new();
        folders.insert("processed".to_string(), "Processed".to_string());
        folders.insert("pending".to_string(), "Pending".to_string());
        folders.insert("junk".to_string(), "Junk".to_string());
        folders.insert("approved_ads".to_string(), "Approved-Ads".to_string());
        folders.insert("whitelist".to_string(), "Training/Whitelist".to_string());
        folders.insert("blacklist".to_string(), "Training/Blacklist".to_string());
        folders.insert("vendor".to_string(), "Training/Vendor".to_string());

        AppConfig {
            accounts: vec![Account {
                name: "Example Account".to_string(),
                email: "user@example.com".to_string(),
                server: "imap.example.com".to_string(),
                username: "user@example.com".to_string(),
                password: "changeme".to_string(),
                connection: ConnectionOptions::default(),
                folders,
                env_derived: false,
            }],
            execution: ExecutionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timezone: default_timezone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_account() -> Account {
        Account {
            name: "Test".into(),
            email: "test@example.com".into(),
            server: "imap.example.com".into(),
            username: "test@example.com".into(),
            password: "secret".into(),
            connection: ConnectionOptions::default(),
            folders: HashMap::new(),
            env_derived: false,
        }
    }

    #[test]
    fn is_gmail_detects_both_domains() {
        let mut account = sample_account();
        account.email = "foo@gmail.com".into();
        assert!(account.is_gmail());
        account.email = "foo@googlemail.com".into();
        assert!(account.is_gmail());
        account.email = "foo@example.com".into();
        assert!(!account.is_gmail());
    }

    #[test]
    fn validate_rejects_empty_server() {
        let mut account = sample_account();
        account.server = String::new();
        let config = AppConfig {
            accounts: vec![account],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server"));
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let config = AppConfig {
            execution: ExecutionConfig {
                batch_size: 0,
                ..ExecutionConfig::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = AppConfig {
            accounts: vec![sample_account()],
            ..Default::default()
        };
        config.save(&path).await.unwrap();
        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].email, "test@example.com");
    }

    #[test]
    fn required_folders_excludes_inbox() {
        let mut account = sample_account();
        account.folders.insert("inbox".into(), "INBOX".into());
        account.folders.insert("junk".into(), "Junk".into());
        let required = account.required_folders();
        assert!(required.iter().all(|(role, _)| *role != "inbox"));
        assert_eq!(required.len(), 1);
    }

    #[test]
    fn create_example_validates() {
        let config = AppConfig::create_example();
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn load_prunes_invalid_account_by_default() {
        env::remove_var("MAIL_RULEZ_STRICT_VALIDATION");
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut broken = sample_account();
        broken.server = String::new();
        let config = AppConfig {
            accounts: vec![broken, sample_account()],
            ..Default::default()
        };
        let toml = toml::to_string_pretty(&config).unwrap();
        tokio::fs::write(&path, toml).await.unwrap();

        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].email, "test@example.com");
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn load_fails_hard_when_strict_validation_set() {
        env::set_var("MAIL_RULEZ_STRICT_VALIDATION", "true");
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut broken = sample_account();
        broken.server = String::new();
        let config = AppConfig {
            accounts: vec![broken],
            ..Default::default()
        };
        let toml = toml::to_string_pretty(&config).unwrap();
        tokio::fs::write(&path, toml).await.unwrap();

        let result = AppConfig::load(&path).await;
        env::remove_var("MAIL_RULEZ_STRICT_VALIDATION");
        assert!(result.is_err());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn load_still_fails_on_structural_errors_when_lenient() {
        env::remove_var("MAIL_RULEZ_STRICT_VALIDATION");
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = AppConfig {
            accounts: vec![sample_account()],
            execution: ExecutionConfig {
                batch_size: 0,
                ..ExecutionConfig::default()
            },
            ..Default::default()
        };
        let toml = toml::to_string_pretty(&config).unwrap();
        tokio::fs::write(&path, toml).await.unwrap();

        assert!(AppConfig::load(&path).await.is_err());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn timezone_overridden_by_env_var() {
        env::remove_var("MAIL_RULEZ_STRICT_VALIDATION");
        env::set_var("MAIL_RULEZ_TIMEZONE", "America/New_York");
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = AppConfig {
            accounts: vec![sample_account()],
            ..Default::default()
        };
        let toml = toml::to_string_pretty(&config).unwrap();
        tokio::fs::write(&path, toml).await.unwrap();

        let loaded = AppConfig::load(&path).await.unwrap();
        env::remove_var("MAIL_RULEZ_TIMEZONE");
        assert_eq!(loaded.timezone, "America/New_York");
    }

    #[test]
    fn default_timezone_is_utc() {
        assert_eq!(AppConfig::default().timezone, "UTC");
    }
}
