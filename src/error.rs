//! Crate-wide error taxonomy.
//!
//! Every store, adapter, and worker in this crate returns [`Result<T>`], a thin
//! alias over [`MailRulezError`]. Variants are grouped by the failure-class
//! distinctions callers actually need to make: transient vs. permanent,
//! retryable vs. fatal, degrade-and-continue vs. abort-the-job.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MailRulezError>;

#[derive(Error, Debug)]
pub enum MailRulezError {
    // --- Connection / transport ---
    #[error("IMAP connection failed for {account}: {message}")]
    ConnectionError { account: String, message: String },

    #[error("TLS handshake failed for {host}:{port}: {message}")]
    TlsError {
        host: String,
        port: u16,
        message: String,
    },

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("IMAP authentication rejected for {account}")]
    AuthError { account: String },

    // --- Folder handling ---
    #[error("folder error on '{folder}': {message}")]
    FolderError { folder: String, message: String },

    #[error("folder '{folder}' does not exist or is not selectable")]
    FolderNotFound { folder: String },

    // --- Classification ---
    #[error("classification error: {message}")]
    ClassificationError { message: String },

    #[error("invalid regex pattern '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    // --- Move / delete ---
    #[error("move of {count} message(s) to '{dest}' failed: {message}")]
    MoveError {
        count: usize,
        dest: String,
        message: String,
    },

    #[error("delete of {count} message(s) failed: {message}")]
    DeleteError { count: usize, message: String },

    // --- Retention family ---
    #[error("retention policy '{id}' not found")]
    PolicyNotFound { id: String },

    #[error("invalid retention period: {days} day(s) is below the minimum of {minimum}")]
    InvalidRetentionPeriod { days: i64, minimum: i64 },

    #[error("retention policy validation failed: {message}")]
    PolicyValidation { message: String },

    #[error("no trash folder found for account '{account}'")]
    TrashFolderNotFound { account: String },

    #[error("trash operation failed: {message}")]
    TrashOperationError { message: String },

    #[error("retention execution failed at stage '{stage}': {message}")]
    RetentionExecutionError { stage: String, message: String },

    // --- Processor lifecycle ---
    #[error("processor for '{account}' hit the consecutive-error ceiling ({count} failures)")]
    ConsecutiveErrorCeiling { account: String, count: u32 },

    #[error("invalid state transition for '{account}': cannot {action} while {state}")]
    InvalidStateTransition {
        account: String,
        action: String,
        state: String,
    },

    #[error("processor for account '{account}' not found")]
    AccountNotFound { account: String },

    // --- Configuration ---
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("configuration validation failed:\n{}", .0.join("\n"))]
    ConfigValidation(Vec<String>),

    // --- Ambient I/O / serialization ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("IMAP protocol error: {0}")]
    Imap(String),

    #[error("{0}")]
    Unknown(String),
}

impl MailRulezError {
    /// Whether a retry of the same operation might succeed.
    ///
    /// Mirrors the transient/permanent split the circuit breaker and the
    /// `with_retry` helper dispatch on: connection hiccups and timeouts are
    /// worth another attempt, everything that reflects a decision already
    /// made by the server or the caller is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MailRulezError::ConnectionError { .. }
                | MailRulezError::TlsError { .. }
                | MailRulezError::Timeout { .. }
                | MailRulezError::Io(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    pub fn connection(account: impl Into<String>, message: impl Into<String>) -> Self {
        MailRulezError::ConnectionError {
            account: account.into(),
            message: message.into(),
        }
    }

    pub fn folder(folder: impl Into<String>, message: impl Into<String>) -> Self {
        MailRulezError::FolderError {
            folder: folder.into(),
            message: message.into(),
        }
    }
}

impl From<imap::Error> for MailRulezError {
    fn from(e: imap::Error) -> Self {
        match e {
            imap::Error::Io(io) => MailRulezError::Io(io),
            other => MailRulezError::Imap(other.to_string()),
        }
    }
}

impl From<native_tls::Error> for MailRulezError {
    fn from(e: native_tls::Error) -> Self {
        MailRulezError::TlsError {
            host: String::new(),
            port: 0,
            message: e.to_string(),
        }
    }
}
