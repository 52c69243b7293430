use std::time::Duration;

// ---

use r66_domain::ErrorCode;

// ---------------------------------------------------------------------------
// TransportScript
// ---------------------------------------------------------------------------

/// What a [`crate::ScriptedTransport`] does on every call.
///
/// Defaults to an instant, successful one-block transfer.
#[derive(Debug, Clone)]
pub struct TransportScript {
    // ---
    /// Last block of the file. The transport acks every block from the
    /// start rank up to this one.
    pub total_blocks: u32,

    /// If `Some(n)`, the link drops once block `n` is acked and the call
    /// fails with a connectivity error.
    pub drop_at: Option<u32>,

    /// If `Some`, the peer refuses the transfer outright with this code.
    pub refuse: Option<ErrorCode>,

    /// Pause before the first block. Lets tests observe a live transfer.
    pub delay: Duration,

    /// Path reported as the delivered file, if any.
    pub delivered: Option<String>,
}

// ---

impl Default for TransportScript {
    fn default() -> Self {
        // ---
        Self {
            total_blocks: 1,
            drop_at: None,
            refuse: None,
            delay: Duration::ZERO,
            delivered: None,
        }
    }
}

// ---

impl TransportScript {
    // ---
    /// Clean transfer of `blocks` blocks.
    pub fn succeed(blocks: u32) -> Self {
        Self {
            total_blocks: blocks,
            ..Default::default()
        }
    }

    // ---

    /// Link lost after block `n`; the file never completes.
    pub fn drop_after(n: u32) -> Self {
        // ---
        Self {
            total_blocks: u32::MAX,
            drop_at: Some(n),
            ..Default::default()
        }
    }

    // ---

    /// Peer rejects the request for a business reason.
    pub fn refuse(code: ErrorCode) -> Self {
        Self {
            refuse: Some(code),
            ..Default::default()
        }
    }

    // ---

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delivering(mut self, path: impl Into<String>) -> Self {
        self.delivered = Some(path.into());
        self
    }
}
