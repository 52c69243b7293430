//! [`ArchiveJournal`] — JSON markers standing in for the store.
//!
//! Without a store every record is kept as
//! `<arch>/<requester>_<requested>_<id>.json`. At startup the no-store
//! commander scans the directory and picks up whatever was left running.

use std::io;
use std::path::PathBuf;

// ---

use r66_domain::{TransferKey, TransferRecord};

// ---------------------------------------------------------------------------
// ArchiveJournal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchiveJournal {
    dir: PathBuf,
}

impl ArchiveJournal {
    // ---
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    // ---

    /// Write the marker for `record`, replacing any previous one.
    ///
    /// Written to a temporary name first so a crash never leaves a
    /// truncated marker behind.
    pub async fn write(&self, record: &TransferRecord) -> io::Result<()> {
        // ---
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let target = self.dir.join(record.archive_name());
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await
    }

    // ---

    pub async fn load(&self, key: &TransferKey) -> io::Result<Option<TransferRecord>> {
        // ---
        let name = format!("{}_{}_{}.json", key.requester, key.requested, key.transfer_id);
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ---

    /// Every readable marker. Unparseable files are logged and skipped.
    pub async fn scan(&self) -> io::Result<Vec<TransferRecord>> {
        // ---
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "archive marker unreadable");
                    continue;
                }
            };
            match serde_json::from_slice::<TransferRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "archive marker skipped");
                }
            }
        }
        records.sort_by(|a, b| (a.start, a.transfer_id).cmp(&(b.start, b.transfer_id)));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use r66_domain::{GlobalStep, UpdatedInfo};

    fn record(id: i64) -> TransferRecord {
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: id,
        };
        TransferRecord::new("hosta", key, "default", true, "f.bin")
    }

    #[tokio::test]
    async fn scan_returns_written_markers_and_skips_garbage() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let journal = ArchiveJournal::new(dir.path().join("arch"));

        let mut first = record(1);
        first.global_step = GlobalStep::TransferTask;
        first.rank = 7;
        first.updated_info = UpdatedInfo::Interrupted;
        journal.write(&first).await.unwrap();
        journal.write(&record(2)).await.unwrap();
        tokio::fs::write(dir.path().join("arch/broken.json"), b"{not json")
            .await
            .unwrap();

        let found = journal.scan().await.unwrap();
        assert_eq!(found.len(), 2, "broken marker must be skipped, not fatal");
        let resumed = found.iter().find(|r| r.transfer_id == 1).unwrap();
        assert_eq!(resumed.rank, 7);
    }

    #[tokio::test]
    async fn missing_directory_scans_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ArchiveJournal::new(dir.path().join("nowhere"));
        assert!(journal.scan().await.unwrap().is_empty());
        assert!(journal.load(&record(3).key()).await.unwrap().is_none());
    }
}
