//! [`TransferFile`] — the file a transfer works on.
//!
//! One type for every file. Whether it sits inside the host's managed
//! directories or somewhere else on disk is the `is_external` flag, decided
//! once when the handle is resolved.

use std::io;
use std::path::{Path, PathBuf};

/// Suffix of a file still being received.
pub const TEMP_EXTENSION: &str = ".part";

// ---------------------------------------------------------------------------
// TransferFile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    // ---
    path: PathBuf,
    is_external: bool,
}

impl TransferFile {
    // ---
    /// Resolve `name` against `base`; absolute names are kept as given.
    /// The file is external when it does not live under `base`.
    pub fn resolve(name: &str, base: &Path) -> Self {
        // ---
        let candidate = Path::new(name);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            base.join(candidate)
        };
        let is_external = !path.starts_with(base);
        Self { path, is_external }
    }

    // ---

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    pub fn display(&self) -> String {
        self.path.display().to_string()
    }

    // ---

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name with any in-progress suffix removed.
    pub fn true_file_name(&self) -> String {
        let name = self.file_name();
        match name.strip_suffix(TEMP_EXTENSION) {
            Some(stripped) if !stripped.is_empty() => stripped.to_string(),
            _ => name,
        }
    }

    // ---

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn size(&self) -> io::Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }

    // ---

    /// Move the file to `target`, creating parent directories.  Falls back
    /// to copy and delete when a plain rename is refused (another device).
    pub async fn rename_to(&self, target: &Path) -> io::Result<TransferFile> {
        // ---
        ensure_parent(target).await?;
        if tokio::fs::rename(&self.path, target).await.is_err() {
            tokio::fs::copy(&self.path, target).await?;
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(self.with_path(target))
    }

    // ---

    pub async fn copy_to(&self, target: &Path) -> io::Result<TransferFile> {
        ensure_parent(target).await?;
        tokio::fs::copy(&self.path, target).await?;
        Ok(self.with_path(target))
    }

    // ---

    pub async fn delete(&self) -> io::Result<()> {
        tokio::fs::remove_file(&self.path).await
    }

    // ---

    fn with_path(&self, target: &Path) -> TransferFile {
        // A moved file keeps its managed status only if it stays beside the
        // original's managed location.
        let is_external = self.is_external
            || self
                .path
                .parent()
                .is_some_and(|dir| !target.starts_with(dir));
        TransferFile {
            path: target.to_path_buf(),
            is_external,
        }
    }
}

// ---

async fn ensure_parent(target: &Path) -> io::Result<()> {
    match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir).await,
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn resolve_marks_outside_paths_external() {
        // ---
        let base = Path::new("/srv/r66/in");
        let inside = TransferFile::resolve("data.bin", base);
        assert_eq!(inside.path(), Path::new("/srv/r66/in/data.bin"));
        assert!(!inside.is_external());

        let outside = TransferFile::resolve("/tmp/data.bin", base);
        assert!(outside.is_external());
    }

    #[test]
    fn true_file_name_strips_temp_suffix_only() {
        // ---
        let base = Path::new("/w");
        assert_eq!(TransferFile::resolve("a.txt.part", base).true_file_name(), "a.txt");
        assert_eq!(TransferFile::resolve("a.txt", base).true_file_name(), "a.txt");
        assert_eq!(TransferFile::resolve(".part", base).true_file_name(), ".part");
    }

    #[tokio::test]
    async fn rename_creates_target_directory() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();

        let file = TransferFile::resolve("src.txt", dir.path());
        let target = dir.path().join("nested/deeper/dst.txt");
        let moved = file.rename_to(&target).await.unwrap();

        assert!(moved.exists().await);
        assert!(!file.exists().await, "source should be gone after a move");
        assert_eq!(moved.size().await.unwrap(), 5);
    }
}
