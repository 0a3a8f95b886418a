//! Shared data types that flow between the IMAP adapter, the rule evaluator,
//! and the retention subsystem.
//!
//! Kept deliberately small: the adapter and stores each own their richer
//! request/response shapes, but every component agrees on what a "message"
//! and a "folder" look like at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only representation of a message the core needs: headers, never a body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageHeader {
    pub uid: u32,
    pub subject: String,
    pub sender: String,
    pub date: DateTime<Utc>,
}

impl MessageHeader {
    /// The bare `addr@domain` portion of `sender`, tolerant of the
    /// `Display Name <addr@domain>` form mail clients commonly send.
    pub fn sender_address(&self) -> &str {
        extract_address(&self.sender)
    }

    /// Domain portion of [`Self::sender_address`], lowercased.
    pub fn sender_domain(&self) -> String {
        extract_address(&self.sender)
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .unwrap_or_default()
    }
}

/// Strip a `Name <addr@dom>` wrapper down to the bare address, if present.
pub fn extract_address(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.rfind('<') {
        let rest = &trimmed[start + 1..];
        rest.trim_end_matches('>').trim()
    } else {
        trimmed
    }
}

/// One entry from `list_folders`: name plus the flags/delimiter the server reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderInfo {
    pub name: String,
    pub delimiter: Option<String>,
    pub flags: Vec<String>,
}

/// Server-reserved containers, `NOSELECT` mailboxes, and namespace roots are
/// never shown to callers as folders a message can be routed into.
pub fn is_user_folder(info: &FolderInfo) -> bool {
    let name = info.name.as_str();
    if name.starts_with('&') || name.starts_with('#') {
        return false;
    }
    if name.starts_with('[') && name.contains(']') {
        // `[Gmail]` itself is a namespace root; `[Gmail]/All Mail` is a real
        // child folder and should still pass.
        let closing = name.find(']').unwrap_or(0);
        if closing + 1 == name.len() {
            return false;
        }
    }
    if info
        .flags
        .iter()
        .any(|f| f.eq_ignore_ascii_case(r"\Noselect"))
    {
        return false;
    }
    true
}

/// Outcome of a Gmail-aware move: the underlying `MOVE` plus however many
/// `X-GM-LABELS` removals were needed to drop the source label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GmailMoveResult {
    pub moved: usize,
    pub labels_removed: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn header(sender: &str) -> MessageHeader {
        MessageHeader {
            uid: 1,
            subject: "hi".into(),
            sender: sender.into(),
            date: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn extract_address_strips_display_name() {
        assert_eq!(extract_address("Alice <alice@x.com>"), "alice@x.com");
        assert_eq!(extract_address("alice@x.com"), "alice@x.com");
        assert_eq!(extract_address("  Bob <bob@y.com>  "), "bob@y.com");
    }

    #[test]
    fn sender_domain_is_lowercased() {
        let h = header("Alice <alice@EXAMPLE.com>");
        assert_eq!(h.sender_domain(), "example.com");
    }

    #[test]
    fn is_user_folder_excludes_gmail_root_and_noselect() {
        let root = FolderInfo {
            name: "[Gmail]".into(),
            delimiter: Some("/".into()),
            flags: vec![],
        };
        assert!(!is_user_folder(&root));

        let child = FolderInfo {
            name: "[Gmail]/All Mail".into(),
            delimiter: Some("/".into()),
            flags: vec![],
        };
        assert!(is_user_folder(&child));

        let noselect = FolderInfo {
            name: "Archive".into(),
            delimiter: Some("/".into()),
            flags: vec![r"\Noselect".into()],
        };
        assert!(!is_user_folder(&noselect));

        let inbox = FolderInfo {
            name: "INBOX".into(),
            delimiter: Some("/".into()),
            flags: vec![],
        };
        assert!(is_user_folder(&inbox));
    }

    #[test]
    fn is_user_folder_excludes_namespace_prefixes() {
        let shared = FolderInfo {
            name: "&ZeVnLIqe-".into(),
            delimiter: Some("/".into()),
            flags: vec![],
        };
        assert!(!is_user_folder(&shared));
    }
}
