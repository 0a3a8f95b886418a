//! mailrulez
//!
//! A multi-account IMAP email classification and lifecycle engine. Accounts
//! are polled on independent schedules, messages are routed by user-defined
//! rules plus three trainable sender lists (whitelist/blacklist/vendor), and
//! a retention subsystem moves aged mail through a trash folder before
//! permanent deletion.
//!
//! # Module organization
//!
//! - [`config`] - account and execution configuration
//! - [`error`] - crate-wide error taxonomy
//! - [`atomic`] - atomic file writes shared by every on-disk store
//! - [`concurrency`] - connection limiting
//! - [`circuit_breaker`] - per-account failure circuit breaker
//! - [`models`] - message/folder types shared across the adapter and stores
//! - [`imap_client`] - the IMAP session adapter, including Gmail label handling
//! - [`lists`] - sender whitelist/blacklist/vendor list store
//! - [`rules`] - rule store and condition/action evaluator
//! - [`retention`] - retention policy store, audit log, trash manager, scheduler
//! - [`processor`] - per-account processor state machine
//! - [`task_manager`] - fleet-wide processor registry
//! - [`control`] - control-plane adapter consumed by the CLI/UI layer
//! - [`cli`] - command-line interface

pub mod atomic;
pub mod circuit_breaker;
pub mod concurrency;
pub mod config;
pub mod control;
pub mod error;
pub mod imap_client;
pub mod lists;
pub mod models;
pub mod processor;
pub mod retention;
pub mod rules;
pub mod task_manager;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{MailRulezError, Result};

pub use config::{Account, AppConfig, Dirs};
pub use models::{FolderInfo, GmailMoveResult, MessageHeader};
pub use rules::{Action, Condition, ConditionLogic, Rule, RuleStore};
pub use lists::ListStore;
pub use retention::{PolicyStore, RetentionManager, RetentionPolicy, RetentionScheduler, TrashManager};
pub use processor::{EmailProcessor, ProcessorMode, ProcessorState, ProcessorStats};
pub use task_manager::TaskManager;
pub use control::ControlPlane;
