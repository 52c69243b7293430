use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;

// ---

use super::error::TransportError;
use super::record::TransferRecord;

// ---------------------------------------------------------------------------
// BlockProgress
// ---------------------------------------------------------------------------

/// Rank bookkeeping shared between the worker and the data stage.
///
/// The transport acknowledges blocks as the peer confirms them; the worker
/// reads the rank back once the stage ends, whatever the outcome, so an
/// interrupted transfer resumes from the last confirmed block.
#[derive(Debug)]
pub struct BlockProgress {
    // ---
    start_rank: u32,
    rank: AtomicU32,
}

impl BlockProgress {
    // ---
    pub fn new(start_rank: u32) -> Self {
        Self {
            start_rank,
            rank: AtomicU32::new(start_rank),
        }
    }

    // ---

    /// First block to send.
    pub fn start_rank(&self) -> u32 {
        self.start_rank
    }

    // ---

    /// Record `rank` as acknowledged. Never moves the rank backwards.
    pub fn ack(&self, rank: u32) {
        self.rank.fetch_max(rank, Ordering::AcqRel);
    }

    // ---

    pub fn rank(&self) -> u32 {
        self.rank.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// BlockTransport
// ---------------------------------------------------------------------------

/// Data stage of a transfer.
///
/// Implementations own framing and connection handling. The engine only
/// needs the resume point in and the acknowledged rank out.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    // ---
    /// Move the file of `record` starting at `progress.start_rank()`.
    ///
    /// Returns the path of the delivered file when it differs from
    /// `record.filename` (receiver side), `None` otherwise.
    async fn transfer(
        &self,
        record: &TransferRecord,
        progress: &BlockProgress,
    ) -> Result<Option<String>, TransportError>;

    /// Release network resources. Called once on hard stop.
    async fn close(&self) {}
}

// ---

pub type BlockTransportPtr = Arc<dyn BlockTransport>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::BlockProgress;

    #[test]
    fn rank_never_regresses() {
        // ---
        let p = BlockProgress::new(7);
        p.ack(9);
        p.ack(8);
        assert_eq!(p.rank(), 9, "late ack of an older block must not rewind");
        assert_eq!(p.start_rank(), 7);
    }
}
