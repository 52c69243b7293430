//! Loopback data stage — copies a transfer's file block by block into a
//! local peer directory through the traffic shaper's write path.
//!
//! ```text
//!  out/<file> ──read block──▶ GlobalChannelShaper::on_write ──▶ FileSink
//!     seek(rank * block_size)        (may queue / delay)         <peer>/in/<file>.part
//!                                            │
//!                 progress.ack(rank) ◀── receipt
//! ```
//!
//! A resumed transfer seeks both files to `start_rank * block_size`, so
//! acknowledged blocks are never sent twice. The `.part` file is renamed
//! once the last block lands.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

// ---

use r66_domain::{BlockProgress, BlockTransport, ErrorCode, TransferRecord, TransportError};
use r66_engine::TEMP_EXTENSION;
use r66_shaper::{ChannelId, ChannelPtr, GlobalChannelShaper, ShapedChannel, ShaperError};

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Shaped channel whose far end is a file.
struct FileSink {
    // ---
    id: ChannelId,
    file: Mutex<File>,
    active: AtomicBool,
    auto_read: AtomicBool,
    writable: AtomicBool,
}

impl FileSink {
    fn new(file: File) -> Self {
        Self {
            id: NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed),
            file: Mutex::new(file),
            active: AtomicBool::new(true),
            auto_read: AtomicBool::new(true),
            writable: AtomicBool::new(true),
        }
    }
}

impl ShapedChannel for FileSink {
    // ---
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    fn set_auto_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::Release);
    }

    fn set_user_writable(&self, writable: bool) {
        if !writable {
            tracing::trace!(channel = self.id, "sink not writable");
        }
        self.writable.store(writable, Ordering::Release);
    }

    fn write(&self, payload: Bytes) -> std::io::Result<()> {
        self.file.lock().write_all(&payload)
    }

    fn flush(&self) -> std::io::Result<()> {
        self.file.lock().flush()
    }
}

// ---------------------------------------------------------------------------
// LocalBlockTransport
// ---------------------------------------------------------------------------

pub struct LocalBlockTransport {
    // ---
    shaper: Arc<GlobalChannelShaper>,
    /// Relative file names are read from here.
    source_dir: PathBuf,
    /// The peer's receiving directory.
    dest_dir: PathBuf,
}

impl LocalBlockTransport {
    // ---
    pub fn new(
        shaper: Arc<GlobalChannelShaper>,
        source_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shaper,
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
        }
    }

    // ---

    fn source_of(&self, record: &TransferRecord) -> PathBuf {
        let path = Path::new(&record.filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_dir.join(path)
        }
    }

    // ---

    async fn copy_blocks(
        &self,
        channel: &ChannelPtr,
        source: &Path,
        block_size: u64,
        progress: &BlockProgress,
    ) -> Result<(), TransportError> {
        // ---
        let mut input = tokio::fs::File::open(source).await?;
        let offset = u64::from(progress.start_rank()) * block_size;
        input.seek(SeekFrom::Start(offset)).await?;

        let mut rank = progress.start_rank();
        let mut buf = vec![0u8; block_size as usize];
        loop {
            let n = read_block(&mut input, &mut buf).await?;
            if n == 0 {
                break;
            }
            let receipt = self
                .shaper
                .on_write(channel, Bytes::copy_from_slice(&buf[..n]));
            receipt.wait().await.map_err(|e| match e {
                ShaperError::ChannelClosed => {
                    TransportError::Connectivity("channel closed mid-transfer".into())
                }
                ShaperError::Io(io) => TransportError::Io(io),
            })?;
            rank += 1;
            progress.ack(rank);
            if n < buf.len() {
                break;
            }
        }
        channel.flush()?;
        Ok(())
    }
}

// ---

/// Fill `buf` unless the file ends first. Returns bytes read.
async fn read_block(input: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    // ---
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ---

#[async_trait]
impl BlockTransport for LocalBlockTransport {
    // ---
    async fn transfer(
        &self,
        record: &TransferRecord,
        progress: &BlockProgress,
    ) -> Result<Option<String>, TransportError> {
        // ---
        let source = self.source_of(record);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(TransportError::Business {
                code: ErrorCode::FileNotFound,
                reason: format!("no such file: {}", source.display()),
            });
        }
        let Some(name) = source.file_name() else {
            return Err(TransportError::Business {
                code: ErrorCode::FileNotFound,
                reason: format!("not a file: {}", source.display()),
            });
        };

        tokio::fs::create_dir_all(&self.dest_dir).await?;
        let final_path = self.dest_dir.join(name);
        let mut part_name = name.to_os_string();
        part_name.push(TEMP_EXTENSION);
        let part_path = self.dest_dir.join(part_name);

        let block_size = u64::from(record.block_size.max(1));
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part_path)?;
        // Drop anything past the last acknowledged block.
        let offset = u64::from(progress.start_rank()) * block_size;
        out.set_len(offset)?;
        out.seek(SeekFrom::Start(offset))?;

        let sink = Arc::new(FileSink::new(out));
        let channel: ChannelPtr = sink.clone();
        self.shaper.channel_open(&channel);

        tracing::info!(
            key = %record.key(),
            file = %source.display(),
            start_rank = progress.start_rank(),
            "data stage started",
        );
        let result = self.copy_blocks(&channel, &source, block_size, progress).await;

        self.shaper.channel_closed(&channel);
        sink.active.store(false, Ordering::Release);
        result?;

        tokio::fs::rename(&part_path, &final_path).await?;
        tracing::info!(
            key = %record.key(),
            dest = %final_path.display(),
            rank = progress.rank(),
            "data stage complete",
        );
        // A sender keeps its own copy; only the receiving side adopts the new path.
        if record.is_sender {
            Ok(None)
        } else {
            Ok(Some(final_path.display().to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use r66_domain::TransferKey;
    use r66_shaper::ShaperConfig;

    fn record(file: &str, block_size: u32) -> TransferRecord {
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: 1,
        };
        TransferRecord::new("hosta", key, "default", true, file).with_block_size(block_size)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn copies_every_block_and_counts_ranks() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("a.bin"), payload(10_000)).unwrap();

        let shaper = GlobalChannelShaper::new(ShaperConfig::default());
        let t = LocalBlockTransport::new(shaper, &out, dir.path().join("peer"));
        let progress = BlockProgress::new(0);
        let delivered = t.transfer(&record("a.bin", 4096), &progress).await.unwrap();

        let dest = dir.path().join("peer").join("a.bin");
        assert_eq!(delivered, None, "sender keeps its file name");
        assert_eq!(std::fs::read(&dest).unwrap(), payload(10_000));
        assert_eq!(progress.rank(), 3, "two full blocks and one partial");
        assert!(!dir.path().join("peer").join("a.bin.part").exists());
    }

    #[tokio::test]
    async fn resume_sends_only_missing_blocks() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let peer = dir.path().join("peer");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::create_dir_all(&peer).unwrap();
        let data = payload(4 * 1024);
        std::fs::write(out.join("b.bin"), &data).unwrap();
        // Two blocks already landed, plus a torn third one.
        std::fs::write(peer.join("b.bin.part"), &data[..2 * 1024 + 100]).unwrap();

        let shaper = GlobalChannelShaper::new(ShaperConfig::default());
        let t = LocalBlockTransport::new(shaper.clone(), &out, &peer);
        let progress = BlockProgress::new(2);
        t.transfer(&record("b.bin", 1024), &progress).await.unwrap();

        assert_eq!(std::fs::read(peer.join("b.bin")).unwrap(), data);
        assert_eq!(progress.rank(), 4);
        assert_eq!(
            shaper.global_snapshot().real_written,
            2 * 1024,
            "only the missing blocks went through the shaper"
        );
    }

    #[tokio::test]
    async fn missing_source_is_refused() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let shaper = GlobalChannelShaper::new(ShaperConfig::default());
        let t = LocalBlockTransport::new(shaper, dir.path(), dir.path().join("peer"));
        let err = t
            .transfer(&record("nope.bin", 1024), &BlockProgress::new(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Business { code: ErrorCode::FileNotFound, .. }
        ));
    }
}
