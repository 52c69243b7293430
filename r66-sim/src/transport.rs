use std::sync::atomic::{AtomicUsize, Ordering};

// ---

use async_trait::async_trait;
use parking_lot::Mutex;

// ---

use r66_domain::{BlockProgress, BlockTransport, TransferRecord, TransportError};

// ---

use super::config::TransportScript;

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// In-process data stage. Moves no bytes; acks ranks per its script and
/// records what the engine asked of it.
pub struct ScriptedTransport {
    // ---
    script: TransportScript,
    start_ranks: Mutex<Vec<u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

// ---

impl ScriptedTransport {
    // ---
    pub fn new(script: TransportScript) -> Self {
        Self {
            script,
            start_ranks: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    // ---

    /// Start rank of every call, in call order.
    pub fn start_ranks(&self) -> Vec<u32> {
        self.start_ranks.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.start_ranks.lock().len()
    }

    /// Highest number of calls seen in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }
}

// ---

/// Decrements the in-flight count even when the call is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---

#[async_trait]
impl BlockTransport for ScriptedTransport {
    // ---
    async fn transfer(
        &self,
        record: &TransferRecord,
        progress: &BlockProgress,
    ) -> Result<Option<String>, TransportError> {
        // ---
        self.start_ranks.lock().push(progress.start_rank());
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let _in_flight = InFlight(&self.in_flight);

        tracing::debug!(
            key = %record.key(),
            start_rank = progress.start_rank(),
            "scripted transfer",
        );

        if let Some(code) = self.script.refuse {
            return Err(TransportError::Business {
                code,
                reason: "refused by scripted peer".into(),
            });
        }

        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }

        let mut rank = progress.start_rank();
        while rank < self.script.total_blocks {
            rank += 1;
            progress.ack(rank);
            if self.script.drop_at == Some(rank) {
                return Err(TransportError::Connectivity(format!(
                    "link dropped after block {rank}"
                )));
            }
        }
        if let Some(n) = self.script.drop_at {
            if n <= progress.start_rank() {
                return Err(TransportError::Connectivity("link down".into()));
            }
        }
        Ok(self.script.delivered.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use r66_domain::{ErrorCode, TransferKey};

    fn record() -> TransferRecord {
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: 1,
        };
        TransferRecord::new("hosta", key, "default", true, "f")
    }

    #[tokio::test]
    async fn drop_keeps_acked_rank() {
        // ---
        let t = ScriptedTransport::new(TransportScript::drop_after(4));
        let progress = BlockProgress::new(0);
        let err = t.transfer(&record(), &progress).await.unwrap_err();
        assert!(matches!(err, TransportError::Connectivity(_)));
        assert_eq!(progress.rank(), 4);
    }

    #[tokio::test]
    async fn resume_acks_only_remaining_blocks() {
        // ---
        let t = ScriptedTransport::new(TransportScript::succeed(10));
        let progress = BlockProgress::new(7);
        t.transfer(&record(), &progress).await.unwrap();
        assert_eq!(progress.rank(), 10);
        assert_eq!(t.start_ranks(), vec![7]);
    }

    #[tokio::test]
    async fn refusal_is_a_business_error() {
        // ---
        let t = ScriptedTransport::new(TransportScript::refuse(ErrorCode::NotAuthenticated));
        let err = t.transfer(&record(), &BlockProgress::new(0)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Business { code: ErrorCode::NotAuthenticated, .. }
        ));
        assert_eq!(t.max_concurrent(), 1);
    }
}
