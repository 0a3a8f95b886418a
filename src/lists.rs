//! Sender-list store: one line-delimited text file per list under the lists
//! directory. Three built-in lists (white, black, vendor) plus any other
//! `.txt` file a user drops in are discovered automatically.
//!
//! Every write is a read-modify-write of the whole file, serialized behind
//! a per-file lock and landed via [`crate::atomic::write_atomic`] so readers
//! never observe a partial rewrite.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

pub const BUILTIN_LISTS: &[&str] = &["white", "black", "vendor"];

/// A single list's on-disk path plus the mutex serializing writes to it.
struct ListFile {
    path: PathBuf,
    lock: Mutex<()>,
}

/// Mediates every read/write of every list file so no two callers ever open
/// the same file concurrently (the redesign note in §9 on "global mutable
/// sender-list files accessed by multiple processors").
pub struct ListStore {
    dir: PathBuf,
    files: std::sync::RwLock<HashMap<String, Arc<ListFile>>>,
}

impl ListStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: std::sync::RwLock::new(HashMap::new()),
        }
    }

    fn file_for(&self, name: &str) -> Arc<ListFile> {
        if let Some(existing) = self.files.read().unwrap().get(name) {
            return existing.clone();
        }
        let mut files = self.files.write().unwrap();
        files
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ListFile {
                    path: self.dir.join(format!("{name}.txt")),
                    lock: Mutex::new(()),
                })
            })
            .clone()
    }

    /// Built-in three plus every other `*.txt` file already present on disk.
    pub async fn all_lists(&self) -> Result<HashMap<String, PathBuf>> {
        let mut out = HashMap::new();
        for name in BUILTIN_LISTS {
            out.insert(name.to_string(), self.dir.join(format!("{name}.txt")));
        }
        if self.dir.is_dir() {
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("txt") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        out.entry(stem.to_string()).or_insert(path);
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn read(&self, name: &str) -> Result<Vec<String>> {
        let file = self.file_for(name);
        let _guard = file.lock.lock().await;
        read_lines(&file.path).await
    }

    pub async fn add(&self, name: &str, address: &str) -> Result<()> {
        let file = self.file_for(name);
        let _guard = file.lock.lock().await;
        let mut lines = read_lines(&file.path).await?;
        if !lines.iter().any(|l| l.eq_ignore_ascii_case(address)) {
            lines.push(address.to_string());
        }
        write_lines(&file.path, &lines).await
    }

    pub async fn remove(&self, name: &str, address: &str) -> Result<()> {
        let file = self.file_for(name);
        let _guard = file.lock.lock().await;
        let mut lines = read_lines(&file.path).await?;
        lines.retain(|l| !l.eq_ignore_ascii_case(address));
        write_lines(&file.path, &lines).await
    }

    /// `remove` from `from` then `add` to `to`. Callers composing two lists
    /// must tolerate the address transiently existing in neither, since
    /// the two are separate locked operations, not one transaction.
    pub async fn move_address(&self, address: &str, from: &str, to: &str) -> Result<()> {
        self.remove(from, address).await?;
        self.add(to, address).await?;
        Ok(())
    }

    /// Removes empty lines, collapsing them in place.
    pub async fn rm_blanks(&self, name: &str) -> Result<()> {
        let file = self.file_for(name);
        let _guard = file.lock.lock().await;
        let lines = read_lines(&file.path).await?;
        let cleaned: Vec<String> = lines.into_iter().filter(|l| !l.trim().is_empty()).collect();
        write_lines(&file.path, &cleaned).await
    }

    /// Returns `addr` lowercased for case-insensitive comparison, tolerant
    /// of the `Name <addr@dom>` wrapper form.
    pub async fn contains(&self, name: &str, address: &str) -> Result<bool> {
        let addrs = self.read(name).await?;
        let target = crate::models::extract_address(address).to_lowercase();
        Ok(addrs
            .iter()
            .any(|a| crate::models::extract_address(a).to_lowercase() == target))
    }

    /// Pairs of lists sharing at least one address, case-insensitively.
    /// Consumed by the external list-conflict UI; the core does not resolve
    /// conflicts itself.
    pub async fn conflicts(&self) -> Result<HashMap<(String, String), Vec<String>>> {
        let all = self.all_lists().await?;
        let mut names: Vec<&String> = all.keys().collect();
        names.sort();

        let mut sets: HashMap<&str, HashSet<String>> = HashMap::new();
        for name in &names {
            let addrs = self.read(name).await.unwrap_or_else(|e| {
                warn!(list = %name, error = %e, "failed to read list for conflict detection");
                Vec::new()
            });
            sets.insert(
                name.as_str(),
                addrs.into_iter().map(|a| a.to_lowercase()).collect(),
            );
        }

        let mut conflicts = HashMap::new();
        for i in 0..names.len() {
            for j in (i + 1)..names.len() {
                let a = names[i];
                let b = names[j];
                let shared: Vec<String> = sets[a.as_str()]
                    .intersection(&sets[b.as_str()])
                    .cloned()
                    .collect();
                if !shared.is_empty() {
                    conflicts.insert((a.clone(), b.clone()), shared);
                }
            }
        }
        Ok(conflicts)
    }
}

async fn read_lines(path: &Path) -> Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    crate::atomic::write_atomic(path, content.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn add_then_read_yields_address_exactly_once() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path());
        store.add("white", "alice@x.com").await.unwrap();
        store.add("white", "alice@x.com").await.unwrap();
        store.add("white", "ALICE@x.com").await.unwrap();
        let addrs = store.read("white").await.unwrap();
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_case_insensitively() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path());
        store.add("black", "Bob@Y.com").await.unwrap();
        store.remove("black", "bob@y.com").await.unwrap();
        assert!(store.read("black").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_address_transfers_between_lists() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path());
        store.add("white", "a@b.com").await.unwrap();
        store.move_address("a@b.com", "white", "black").await.unwrap();
        assert!(store.read("white").await.unwrap().is_empty());
        assert_eq!(store.read("black").await.unwrap(), vec!["a@b.com"]);
    }

    #[tokio::test]
    async fn rm_blanks_collapses_empty_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vendor.txt");
        tokio::fs::write(&path, "a@b.com\n\n\nc@d.com\n").await.unwrap();
        let store = ListStore::new(dir.path());
        store.rm_blanks("vendor").await.unwrap();
        let lines = store.read("vendor").await.unwrap();
        assert_eq!(lines, vec!["a@b.com", "c@d.com"]);
    }

    #[tokio::test]
    async fn all_lists_includes_builtins_and_discovered() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("custom.txt"), "x@y.com\n").await.unwrap();
        let store = ListStore::new(dir.path());
        let all = store.all_lists().await.unwrap();
        assert!(all.contains_key("white"));
        assert!(all.contains_key("black"));
        assert!(all.contains_key("vendor"));
        assert!(all.contains_key("custom"));
    }

    #[tokio::test]
    async fn conflicts_detects_cross_list_duplicates() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path());
        store.add("white", "dup@x.com").await.unwrap();
        store.add("black", "DUP@x.com").await.unwrap();
        let conflicts = store.conflicts().await.unwrap();
        let has_conflict = conflicts
            .iter()
            .any(|(_, addrs)| addrs.iter().any(|a| a == "dup@x.com"));
        assert!(has_conflict);
    }

    #[tokio::test]
    async fn contains_strips_display_name_wrapper() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path());
        store.add("white", "alice@x.com").await.unwrap();
        assert!(store.contains("white", "Alice <alice@x.com>").await.unwrap());
    }

    #[tokio::test]
    async fn read_missing_file_returns_empty() {
        let dir = tempdir().unwrap();
        let store = ListStore::new(dir.path());
        assert!(store.read("nope").await.unwrap().is_empty());
    }

    use proptest::prelude::*;

    proptest! {
        /// After any number of `add(name, addr)` calls for the same address
        /// (regardless of casing), `read(name)` contains it exactly once.
        #[test]
        fn repeated_add_never_duplicates(repeats in 1usize..15, upper_case in proptest::bool::ANY) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let store = ListStore::new(dir.path());
                for _ in 0..repeats {
                    let addr = if upper_case { "DUP@EXAMPLE.COM" } else { "dup@example.com" };
                    store.add("white", addr).await.unwrap();
                }
                let addrs = store.read("white").await.unwrap();
                prop_assert_eq!(addrs.len(), 1);
            });
        }
    }
}
