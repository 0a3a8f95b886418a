//! IMAP client adapter: connect, list folders, fetch headers, move/delete/flag,
//! and the Gmail label-extension ops that `gmail_move` needs.
//!
//! The underlying `imap` crate is synchronous; every blocking call here runs
//! inside `spawn_blocking` so the scheduler and processor loops that drive
//! this adapter never block a tokio worker thread on network I/O.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{Account, CircuitBreakerConfig, SecurityMode};
use crate::error::{MailRulezError, Result};
use crate::models::{FolderInfo, GmailMoveResult, MessageHeader};

const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;
const GMAIL_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];

/// Default attempt cap for [`RetryingConnector`] when callers don't
/// override it.
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;

pub fn is_gmail(email: &str) -> bool {
    let lower = email.to_lowercase();
    GMAIL_DOMAINS
        .iter()
        .any(|domain| lower.ends_with(&format!("@{domain}")))
}

/// A single connected IMAP session. Implementations own the socket; the
/// caller (a processor job, a retention stage) opens one per unit of work
/// and lets it drop (which logs out) rather than holding it across jobs.
#[async_trait]
pub trait ImapSession: Send {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>>;
    async fn select(&mut self, folder: &str) -> Result<()>;
    /// Newest-first, headers only, never marks the message seen.
    async fn fetch_headers(&mut self, folder: &str, limit: Option<usize>) -> Result<Vec<MessageHeader>>;
    async fn move_messages(&mut self, uids: &[u32], dest: &str) -> Result<()>;
    /// Permanent delete (store \Deleted then expunge).
    async fn delete_messages(&mut self, uids: &[u32]) -> Result<()>;
    async fn flag(&mut self, uids: &[u32], flag_name: &str, set: bool) -> Result<()>;
    async fn create_folder(&mut self, name: &str) -> Result<()>;
    /// Remove a single Gmail label via the `X-GM-LABELS` store extension.
    async fn gmail_remove_label(&mut self, uid: u32, label: &str) -> Result<()>;
    async fn logout(&mut self) -> Result<()>;
}

/// Opens sessions against real servers. One per account; processors hold a
/// `Arc<dyn ImapConnector>` and call `connect` fresh for every job.
#[async_trait]
pub trait ImapConnector: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Box<dyn ImapSession>>;
}

/// Server-side `MOVE` when on Gmail peels the source label off automatically
/// for a synthetic system attribute (anything starting with `\`, which
/// X-GM-LABELS can't remove anyway) but leaves a literal folder-backed label
/// (e.g. `INBOX`, `Archive`) attached — Gmail represents every mailbox as a
/// label and `MOVE` only adds the destination label. `gmail_move` performs
/// the move, then explicitly strips the source label for each uid.
pub async fn gmail_move(
    session: &mut dyn ImapSession,
    uids: &[u32],
    dest: &str,
    source: &str,
) -> GmailMoveResult {
    let mut result = GmailMoveResult::default();

    if let Err(e) = session.move_messages(uids, dest).await {
        result.errors.push(e.to_string());
        return result;
    }
    result.moved = uids.len();

    if source.starts_with('\\') {
        debug!(source, "skipping removal of synthetic gmail label");
        return result;
    }

    for &uid in uids {
        match session.gmail_remove_label(uid, source).await {
            Ok(()) => result.labels_removed += 1,
            Err(e) => {
                warn!(uid, source, error = %e, "failed to remove gmail source label");
                result.errors.push(format!("uid {uid}: {e}"));
            }
        }
    }

    result
}

/// Moves `uids` from `source` to `dest`, using the Gmail-aware path when the
/// account is hosted on Gmail and a plain server-side `MOVE` otherwise.
pub async fn move_messages_for_account(
    session: &mut dyn ImapSession,
    account: &Account,
    uids: &[u32],
    source: &str,
    dest: &str,
) -> Result<GmailMoveResult> {
    if uids.is_empty() {
        return Ok(GmailMoveResult::default());
    }
    if account.is_gmail() {
        Ok(gmail_move(session, uids, dest, source).await)
    } else {
        session.move_messages(uids, dest).await?;
        Ok(GmailMoveResult {
            moved: uids.len(),
            labels_removed: 0,
            errors: Vec::new(),
        })
    }
}

type TlsSession = imap::Session<native_tls::TlsStream<TcpStream>>;
type PlainSession = imap::Session<TcpStream>;

enum RawSession {
    Tls(TlsSession),
    Plain(PlainSession),
}

impl RawSession {
    fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let names = match self {
            RawSession::Tls(s) => s.list(None, Some("*"))?,
            RawSession::Plain(s) => s.list(None, Some("*"))?,
        };
        Ok(names
            .iter()
            .map(|n| FolderInfo {
                name: n.name().to_string(),
                delimiter: n.delimiter().map(|d| d.to_string()),
                flags: n.attributes().iter().map(|a| format!("{a:?}")).collect(),
            })
            .collect())
    }

    fn select(&mut self, folder: &str) -> Result<()> {
        match self {
            RawSession::Tls(s) => s.select(folder)?,
            RawSession::Plain(s) => s.select(folder)?,
        };
        Ok(())
    }

    fn fetch_headers(&mut self, folder: &str, limit: Option<usize>) -> Result<Vec<MessageHeader>> {
        self.select(folder)?;
        let sequence = match self {
            RawSession::Tls(s) => s.uid_search("ALL")?,
            RawSession::Plain(s) => s.uid_search("ALL")?,
        };
        let mut uids: Vec<u32> = sequence.into_iter().collect();
        uids.sort_unstable();
        uids.reverse(); // newest uid first; IMAP UIDs are monotonically increasing
        if let Some(limit) = limit {
            uids.truncate(limit);
        }
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        // BODY.PEEK never sets \Seen, unlike RFC822.HEADER.
        let query = "(UID BODY.PEEK[HEADER.FIELDS (SUBJECT FROM DATE)] INTERNALDATE)";
        let fetches = match self {
            RawSession::Tls(s) => s.uid_fetch(&set, query)?,
            RawSession::Plain(s) => s.uid_fetch(&set, query)?,
        };

        let mut headers = Vec::with_capacity(fetches.len());
        for fetch in fetches.iter() {
            let uid = match fetch.uid {
                Some(uid) => uid,
                None => continue,
            };
            let raw = fetch
                .header()
                .or_else(|| fetch.body())
                .unwrap_or(&[]);
            let (parsed, _) = mailparse::parse_headers(raw).unwrap_or_default();
            let subject = parsed
                .get_first_value("Subject")
                .unwrap_or_default();
            let sender = parsed.get_first_value("From").unwrap_or_default();
            let date = parsed
                .get_first_value("Date")
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
                .or_else(|| fetch.internal_date().map(|d| d.with_timezone(&Utc)))
                .unwrap_or_else(Utc::now);
            headers.push(MessageHeader {
                uid,
                subject,
                sender,
                date,
            });
        }
        headers.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(headers)
    }

    fn move_messages(&mut self, uids: &[u32], dest: &str) -> Result<()> {
        let set = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        match self {
            RawSession::Tls(s) => s.uid_mv(&set, dest)?,
            RawSession::Plain(s) => s.uid_mv(&set, dest)?,
        };
        Ok(())
    }

    fn delete_messages(&mut self, uids: &[u32]) -> Result<()> {
        let set = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        match self {
            RawSession::Tls(s) => {
                s.uid_store(&set, "+FLAGS (\\Deleted)")?;
                s.expunge()?;
            }
            RawSession::Plain(s) => {
                s.uid_store(&set, "+FLAGS (\\Deleted)")?;
                s.expunge()?;
            }
        };
        Ok(())
    }

    fn flag(&mut self, uids: &[u32], flag_name: &str, set_flag: bool) -> Result<()> {
        let set = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        let op = if set_flag { "+FLAGS" } else { "-FLAGS" };
        let cmd = format!("{op} ({flag_name})");
        match self {
            RawSession::Tls(s) => s.uid_store(&set, &cmd)?,
            RawSession::Plain(s) => s.uid_store(&set, &cmd)?,
        };
        Ok(())
    }

    fn create_folder(&mut self, name: &str) -> Result<()> {
        match self {
            RawSession::Tls(s) => s.create(name)?,
            RawSession::Plain(s) => s.create(name)?,
        };
        Ok(())
    }

    fn gmail_remove_label(&mut self, uid: u32, label: &str) -> Result<()> {
        let escaped = label.replace('\\', "\\\\").replace('"', "\\\"");
        let cmd = format!("-X-GM-LABELS.SILENT (\"{escaped}\")");
        match self {
            RawSession::Tls(s) => s.uid_store(uid.to_string(), &cmd)?,
            RawSession::Plain(s) => s.uid_store(uid.to_string(), &cmd)?,
        };
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        match self {
            RawSession::Tls(s) => s.logout()?,
            RawSession::Plain(s) => s.logout()?,
        };
        Ok(())
    }
}

/// Production [`ImapSession`] backed by a real socket. Every method hands
/// the blocking `imap`-crate call to `spawn_blocking`.
pub struct TcpImapSession {
    inner: Option<RawSession>,
}

macro_rules! blocking {
    ($self:expr, $method:ident $(, $arg:expr)*) => {{
        let mut inner = $self.inner.take().expect("session used after logout");
        let (inner, result) = tokio::task::spawn_blocking(move || {
            let result = inner.$method($($arg),*);
            (inner, result)
        })
        .await
        .map_err(|e| MailRulezError::Unknown(format!("blocking IMAP task panicked: {e}")))?;
        $self.inner = Some(inner);
        result
    }};
}

#[async_trait]
impl ImapSession for TcpImapSession {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        blocking!(self, list_folders)
    }

    async fn select(&mut self, folder: &str) -> Result<()> {
        let folder = folder.to_string();
        blocking!(self, select, &folder)
    }

    async fn fetch_headers(&mut self, folder: &str, limit: Option<usize>) -> Result<Vec<MessageHeader>> {
        let folder = folder.to_string();
        blocking!(self, fetch_headers, &folder, limit)
    }

    async fn move_messages(&mut self, uids: &[u32], dest: &str) -> Result<()> {
        let uids = uids.to_vec();
        let dest = dest.to_string();
        blocking!(self, move_messages, &uids, &dest)
    }

    async fn delete_messages(&mut self, uids: &[u32]) -> Result<()> {
        let uids = uids.to_vec();
        blocking!(self, delete_messages, &uids)
    }

    async fn flag(&mut self, uids: &[u32], flag_name: &str, set: bool) -> Result<()> {
        let uids = uids.to_vec();
        let flag_name = flag_name.to_string();
        blocking!(self, flag, &uids, &flag_name, set)
    }

    async fn create_folder(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        blocking!(self, create_folder, &name)
    }

    async fn gmail_remove_label(&mut self, uid: u32, label: &str) -> Result<()> {
        let label = label.to_string();
        blocking!(self, gmail_remove_label, uid, &label)
    }

    async fn logout(&mut self) -> Result<()> {
        blocking!(self, logout)
    }
}

/// Default [`ImapConnector`]: opens a real TCP/TLS socket per `connect` call.
#[derive(Debug, Clone, Default)]
pub struct TcpImapConnector;

#[async_trait]
impl ImapConnector for TcpImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn ImapSession>> {
        let account = account.clone();
        let raw = tokio::task::spawn_blocking(move || connect_blocking(&account))
            .await
            .map_err(|e| MailRulezError::Unknown(format!("connect task panicked: {e}")))??;
        Ok(Box::new(TcpImapSession { inner: Some(raw) }))
    }
}

fn connect_blocking(account: &Account) -> Result<RawSession> {
    let host = account.server.as_str();
    let port = account.connection.port;
    let timeout = Duration::from_secs(
        if account.connection.timeout_secs == 0 {
            DEFAULT_SOCKET_TIMEOUT_SECS
        } else {
            account.connection.timeout_secs
        },
    );

    let tcp = TcpStream::connect((host, port))
        .map_err(|e| MailRulezError::connection(&account.email, e.to_string()))?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    match account.connection.security {
        SecurityMode::Ssl => {
            let connector = native_tls::TlsConnector::new()?;
            let tls = connector
                .connect(host, tcp)
                .map_err(|e| MailRulezError::TlsError {
                    host: host.to_string(),
                    port,
                    message: e.to_string(),
                })?;
            let client = imap::Client::new(tls);
            let session = client
                .login(&account.username, &account.password)
                .map_err(|(e, _)| {
                    warn!(error = %e, "imap login failed");
                    MailRulezError::AuthError {
                        account: account.email.clone(),
                    }
                })?;
            Ok(RawSession::Tls(session))
        }
        SecurityMode::StartTls => {
            let client = imap::Client::new(tcp);
            let connector = native_tls::TlsConnector::new()?;
            let tls_client = client
                .secure(host, &connector)
                .map_err(|e| MailRulezError::TlsError {
                    host: host.to_string(),
                    port,
                    message: e.to_string(),
                })?;
            let session = tls_client
                .login(&account.username, &account.password)
                .map_err(|(_, _)| MailRulezError::AuthError {
                    account: account.email.clone(),
                })?;
            Ok(RawSession::Tls(session))
        }
        SecurityMode::None => {
            let client = imap::Client::new(tcp);
            let session = client
                .login(&account.username, &account.password)
                .map_err(|(_, _)| MailRulezError::AuthError {
                    account: account.email.clone(),
                })?;
            Ok(RawSession::Plain(session))
        }
    }
}

/// Retries a transient-classified operation with exponential backoff,
/// starting at 1s and capping at 30s between attempts. Permanent errors
/// (auth failures, folder errors, validation errors, ...) are returned
/// immediately without consuming a retry.
pub async fn with_retry<T, F, Fut>(operation_name: &str, max_retries: u32, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts <= max_retries => {
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps any [`ImapConnector`] so that `connect` and the returned
/// session's `fetch_headers` are retried through [`with_retry`]. Sits
/// innermost in the decorator chain (around [`TcpImapConnector`]) so
/// the circuit breaker and connection limiter see the outcome after
/// retries are exhausted, not per individual attempt.
pub struct RetryingConnector {
    inner: Arc<dyn ImapConnector>,
    max_retries: u32,
}

impl RetryingConnector {
    pub fn new(inner: Arc<dyn ImapConnector>, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }
}

struct RetryingSession {
    inner: Box<dyn ImapSession>,
    max_retries: u32,
}

#[async_trait]
impl ImapSession for RetryingSession {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        self.inner.list_folders().await
    }
    async fn select(&mut self, folder: &str) -> Result<()> {
        self.inner.select(folder).await
    }
    async fn fetch_headers(&mut self, folder: &str, limit: Option<usize>) -> Result<Vec<MessageHeader>> {
        let inner = &mut self.inner;
        with_retry("fetch_headers", self.max_retries, || inner.fetch_headers(folder, limit)).await
    }
    async fn move_messages(&mut self, uids: &[u32], dest: &str) -> Result<()> {
        self.inner.move_messages(uids, dest).await
    }
    async fn delete_messages(&mut self, uids: &[u32]) -> Result<()> {
        self.inner.delete_messages(uids).await
    }
    async fn flag(&mut self, uids: &[u32], flag_name: &str, set: bool) -> Result<()> {
        self.inner.flag(uids, flag_name, set).await
    }
    async fn create_folder(&mut self, name: &str) -> Result<()> {
        self.inner.create_folder(name).await
    }
    async fn gmail_remove_label(&mut self, uid: u32, label: &str) -> Result<()> {
        self.inner.gmail_remove_label(uid, label).await
    }
    async fn logout(&mut self) -> Result<()> {
        self.inner.logout().await
    }
}

#[async_trait]
impl ImapConnector for RetryingConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn ImapSession>> {
        let inner = &self.inner;
        let session = with_retry("connect", self.max_retries, || inner.connect(account)).await?;
        Ok(Box::new(RetryingSession {
            inner: session,
            max_retries: self.max_retries,
        }))
    }
}

/// Wraps any [`ImapConnector`] with a per-account [`CircuitBreaker`], so a
/// run of transient connection failures against one account stops
/// hammering that server without affecting the others sharing the fleet's
/// connector. Rejections surface as the same error an open circuit would
/// produce for a direct caller, before the inner connector is ever touched.
pub struct CircuitBreakingConnector {
    inner: Arc<dyn ImapConnector>,
    config: CircuitBreakerConfig,
    breakers: tokio::sync::Mutex<std::collections::HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakingConnector {
    pub fn new(inner: Arc<dyn ImapConnector>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            breakers: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    async fn breaker_for(&self, email: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(email.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()))
            .clone()
    }
}

#[async_trait]
impl ImapConnector for CircuitBreakingConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn ImapSession>> {
        let breaker = self.breaker_for(&account.email).await;
        breaker.check_request().await?;
        match self.inner.connect(account).await {
            Ok(session) => {
                breaker.record_success().await;
                Ok(session)
            }
            Err(e) => {
                breaker.record_failure(&e).await;
                Err(e)
            }
        }
    }
}

/// Wraps any [`ImapConnector`] with a [`ConnectionLimiter`], bounding the
/// number of simultaneously open sessions across the whole fleet at
/// `execution.max_concurrent_connections`. The permit rides along inside
/// the returned session and is released when the caller lets it drop
/// (typically right after `logout`).
pub struct LimitedConnector {
    inner: Arc<dyn ImapConnector>,
    limiter: crate::concurrency::ConnectionLimiter,
}

impl LimitedConnector {
    pub fn new(inner: Arc<dyn ImapConnector>, max_concurrent: usize) -> Self {
        Self {
            inner,
            limiter: crate::concurrency::ConnectionLimiter::new(max_concurrent),
        }
    }
}

struct LimitedSession {
    inner: Box<dyn ImapSession>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[async_trait]
impl ImapSession for LimitedSession {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        self.inner.list_folders().await
    }
    async fn select(&mut self, folder: &str) -> Result<()> {
        self.inner.select(folder).await
    }
    async fn fetch_headers(&mut self, folder: &str, limit: Option<usize>) -> Result<Vec<MessageHeader>> {
        self.inner.fetch_headers(folder, limit).await
    }
    async fn move_messages(&mut self, uids: &[u32], dest: &str) -> Result<()> {
        self.inner.move_messages(uids, dest).await
    }
    async fn delete_messages(&mut self, uids: &[u32]) -> Result<()> {
        self.inner.delete_messages(uids).await
    }
    async fn flag(&mut self, uids: &[u32], flag_name: &str, set: bool) -> Result<()> {
        self.inner.flag(uids, flag_name, set).await
    }
    async fn create_folder(&mut self, name: &str) -> Result<()> {
        self.inner.create_folder(name).await
    }
    async fn gmail_remove_label(&mut self, uid: u32, label: &str) -> Result<()> {
        self.inner.gmail_remove_label(uid, label).await
    }
    async fn logout(&mut self) -> Result<()> {
        self.inner.logout().await
    }
}

#[async_trait]
impl ImapConnector for LimitedConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn ImapSession>> {
        let permit = self.limiter.acquire().await;
        let session = self.inner.connect(account).await?;
        Ok(Box::new(LimitedSession {
            inner: session,
            _permit: permit,
        }))
    }
}
