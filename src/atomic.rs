//! Atomic file replacement for the crate's on-disk stores.
//!
//! Every persistent store (rules, retention policies, sender lists, audit
//! log rewrites) needs readers to observe either the pre-write or
//! post-write byte image, never a partial write. The pattern is always the
//! same: write to a sibling temp file, fsync it, then rename over the
//! target (rename is atomic on the same filesystem). On Unix the file mode
//! is narrowed to 0600 before the rename lands it at its final name.

use std::path::Path;

use crate::error::Result;

pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp_path = sibling_temp_path(path);
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
    }

    set_owner_only_permissions(&tmp_path).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Append `line` (a single record, newline added if missing) to `path`,
/// creating the file if necessary. Appends are not made atomic the same
/// way full rewrites are — the audit log relies on the OS append-mode
/// write being serialized per writer-lock, not on rename semantics.
pub async fn append_line(path: &Path, line: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    set_owner_only_permissions(path).await?;
    Ok(())
}

fn sibling_temp_path(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    let tmp_name = format!(".{file_name}.{}.tmp", std::process::id());
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(tmp_name),
        _ => std::path::PathBuf::from(tmp_name),
    }
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_creates_file_with_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");
        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"a\":1}");
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        write_atomic(&path, b"x").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert_eq!(entry.file_name(), "data.json");
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn write_atomic_overwrites_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        write_atomic(&path, b"old").await.unwrap();
        write_atomic(&path, b"new").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "new");
    }

    #[tokio::test]
    async fn append_line_adds_newline_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line(&path, "{\"a\":1}").await.unwrap();
        append_line(&path, "{\"a\":2}").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_atomic_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_atomic(&path, b"{}").await.unwrap();
        let perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}
