//! Global and per-channel traffic shaping for R66 connections.
//!
//! - [`TrafficCounter`]      — byte accounting and time-to-wait math
//! - [`GlobalChannelShaper`] — global + per-channel limits, delayed write
//!   queue, read suspension and deviation balancing
//! - [`ShapedChannel`]       — what the shaper needs from a connection
//!
//! All times are milliseconds on a [`Clock`] shared by one shaper and its
//! counters.

mod channel;
mod counter;
mod error;
mod shaper;

// --- counter
pub use counter::{AccountingHook, CounterSnapshot, TrafficCounter, MINIMAL_WAIT};

// --- channel
pub use channel::{ChannelId, ChannelPtr, ShapedChannel, WriteReceipt};

// --- error
pub use error::ShaperError;

// --- shaper
pub use shaper::{Deviation, GlobalChannelShaper, ShaperConfig};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Millisecond clock anchored at construction.
///
/// Built on `tokio::time::Instant`, so tests running with a paused runtime
/// clock see the same time the shaper's timers do.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base: Option<tokio::time::Instant>,
}

impl Clock {
    // ---
    pub fn new() -> Self {
        Self {
            base: Some(tokio::time::Instant::now()),
        }
    }

    /// Clock stuck at zero, for tests that pass `now` explicitly.
    #[cfg(test)]
    pub(crate) fn manual() -> Self {
        Self { base: None }
    }

    pub fn now_ms(&self) -> u64 {
        self.base
            .map(|b| b.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
