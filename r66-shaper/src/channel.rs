use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

// ---

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

// ---

use super::{Clock, ShaperError, TrafficCounter};

pub type ChannelId = u64;

// ---------------------------------------------------------------------------
// ShapedChannel
// ---------------------------------------------------------------------------

/// The connection-side surface the shaper drives.
///
/// Every method is called from I/O paths and must not block.
pub trait ShapedChannel: Send + Sync {
    // ---
    fn id(&self) -> ChannelId;

    /// `false` once the underlying connection is gone.
    fn is_active(&self) -> bool;

    fn is_auto_read(&self) -> bool;

    /// Toggle reading from the connection. Disabled while a read is held off.
    fn set_auto_read(&self, enabled: bool);

    /// Backpressure signal to whoever produces writes for this channel.
    fn set_user_writable(&self, writable: bool);

    fn write(&self, payload: Bytes) -> std::io::Result<()>;

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

pub type ChannelPtr = Arc<dyn ShapedChannel>;

// ---------------------------------------------------------------------------
// WriteReceipt
// ---------------------------------------------------------------------------

/// Completes once the write has been handed to the channel (or dropped).
#[derive(Debug)]
pub struct WriteReceipt {
    rx: oneshot::Receiver<Result<(), ShaperError>>,
}

impl WriteReceipt {
    // ---
    pub(crate) fn new() -> (oneshot::Sender<Result<(), ShaperError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Non-blocking check. `None` while the write is still queued.
    pub fn try_result(&mut self) -> Option<Result<(), ShaperError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ShaperError::ChannelClosed)),
        }
    }

    pub async fn wait(self) -> Result<(), ShaperError> {
        self.rx.await.unwrap_or(Err(ShaperError::ChannelClosed))
    }
}

// ---------------------------------------------------------------------------
// PerChannel
// ---------------------------------------------------------------------------

pub(crate) struct ToSend {
    pub release_at: u64,
    pub payload: Bytes,
    pub size: u64,
    pub promise: oneshot::Sender<Result<(), ShaperError>>,
}

/// Queue state, guarded by the channel lock.
#[derive(Default)]
pub(crate) struct ChannelQueue {
    pub queue: VecDeque<ToSend>,
    pub queue_size: u64,
    pub last_write: u64,
    pub last_read: u64,
}

/// Shaping entry for one open channel.
pub(crate) struct PerChannel {
    // ---
    /// Not monitored on its own; the global tick closes its periods.
    pub counter: TrafficCounter,
    pub state: Mutex<ChannelQueue>,
    pub read_suspended: AtomicBool,
}

impl PerChannel {
    // ---
    pub fn new(id: ChannelId, check_interval: u64, clock: Clock) -> Self {
        // ---
        let now = clock.now_ms();
        Self {
            counter: TrafficCounter::new(format!("channel-{id}"), check_interval, clock),
            state: Mutex::new(ChannelQueue {
                last_write: now,
                last_read: now,
                ..Default::default()
            }),
            read_suspended: AtomicBool::new(false),
        }
    }
}
