//! [`TrafficCounter`] — byte accounting and time-to-wait math for one
//! entity (the whole host, or one channel).
//!
//! ## Accounting period
//!
//! Bytes are added to the current period as they are seen.  Every
//! `check_interval` a monitor task closes the period: the current counts
//! move to `last_*`, throughput is derived, and the owner's
//! [`AccountingHook`] runs.  The monitor sleeps *after* the hook returns,
//! so a slow hook stretches the period instead of overlapping it.
//!
//! ```text
//!   last_time                      now
//!      │◄──────── interval ─────────►│
//!      │  current bytes + size        │
//!      │                              │
//!   wait = sum * 1000 / limit - interval + carried_delay
//! ```
//!
//! When less than [`MINIMAL_WAIT`] has elapsed in the current period the
//! previous period is folded in, so the decision right after a reset still
//! sees a full window.  `carried_delay` is how far releases scheduled in the
//! previous period reach into this one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use parking_lot::Mutex;
use tokio::task::JoinHandle;

// ---

use super::Clock;

/// Delays below this are not worth scheduling; the operation proceeds.
pub const MINIMAL_WAIT: u64 = 10;

// ---------------------------------------------------------------------------
// AccountingHook
// ---------------------------------------------------------------------------

/// Called by a counter's monitor after each period closes.
pub trait AccountingHook: Send + Sync {
    fn do_accounting(&self, counter: &TrafficCounter, now: u64);
}

// ---------------------------------------------------------------------------
// CounterSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a counter, for logs and status pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub current_read: u64,
    pub current_written: u64,
    pub last_read_throughput: u64,
    pub last_write_throughput: u64,
    pub cumulative_read: u64,
    pub cumulative_written: u64,
    pub real_written: u64,
}

// ---------------------------------------------------------------------------
// TrafficCounter
// ---------------------------------------------------------------------------

pub struct TrafficCounter {
    // ---
    name: String,
    clock: Clock,
    check_interval: AtomicU64,

    current_read: AtomicU64,
    current_written: AtomicU64,
    real_written: AtomicU64,

    last_read_bytes: AtomicU64,
    last_written_bytes: AtomicU64,
    last_read_throughput: AtomicU64,
    last_write_throughput: AtomicU64,

    cumulative_read: AtomicU64,
    cumulative_written: AtomicU64,
    last_cumulative_time: AtomicU64,

    last_time: AtomicU64,

    // Furthest release time handed out, and its value at the last reset.
    reading_time: AtomicU64,
    writing_time: AtomicU64,
    last_reading_time: AtomicU64,
    last_writing_time: AtomicU64,

    monitor_active: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    hook: Mutex<Option<Weak<dyn AccountingHook>>>,
}

impl std::fmt::Debug for TrafficCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficCounter")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TrafficCounter {
    // ---
    pub fn new(name: impl Into<String>, check_interval_ms: u64, clock: Clock) -> Self {
        // ---
        let now = clock.now_ms();
        Self {
            name: name.into(),
            clock,
            check_interval: AtomicU64::new(check_interval_ms),
            current_read: AtomicU64::new(0),
            current_written: AtomicU64::new(0),
            real_written: AtomicU64::new(0),
            last_read_bytes: AtomicU64::new(0),
            last_written_bytes: AtomicU64::new(0),
            last_read_throughput: AtomicU64::new(0),
            last_write_throughput: AtomicU64::new(0),
            cumulative_read: AtomicU64::new(0),
            cumulative_written: AtomicU64::new(0),
            last_cumulative_time: AtomicU64::new(now),
            last_time: AtomicU64::new(now),
            reading_time: AtomicU64::new(now),
            writing_time: AtomicU64::new(now),
            last_reading_time: AtomicU64::new(now),
            last_writing_time: AtomicU64::new(now),
            monitor_active: AtomicBool::new(false),
            monitor: Mutex::new(None),
            hook: Mutex::new(None),
        }
    }

    // ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check_interval(&self) -> u64 {
        self.check_interval.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Monitor
    // -----------------------------------------------------------------------

    /// Start periodic accounting.  No-op if already running or if
    /// `check_interval` is zero.  Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>, hook: Option<Weak<dyn AccountingHook>>) {
        // ---
        if self.monitor_active.load(Ordering::Acquire) {
            return;
        }
        self.last_time.store(self.clock.now_ms(), Ordering::Release);
        *self.hook.lock() = hook;

        let interval = self.check_interval();
        if interval == 0 {
            return;
        }
        if self.monitor_active.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(period) = weak.upgrade().map(|c| c.check_interval()) else {
                    return;
                };
                tokio::time::sleep(Duration::from_millis(period.max(1))).await;

                let Some(counter) = weak.upgrade() else {
                    return;
                };
                if !counter.monitor_active.load(Ordering::Acquire) {
                    return;
                }
                counter.tick();
            }
        });
        *self.monitor.lock() = Some(handle);
        tracing::debug!(counter = %self.name, interval, "traffic monitor started");
    }

    // ---

    /// Stop periodic accounting, closing the current period one last time.
    pub fn stop(&self) {
        // ---
        if !self.monitor_active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.tick();
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        tracing::debug!(counter = %self.name, "traffic monitor stopped");
    }

    // ---

    pub fn is_monitoring(&self) -> bool {
        self.monitor_active.load(Ordering::Acquire)
    }

    // ---

    /// Change the accounting period.  Zero stops monitoring.
    pub fn configure(self: &Arc<Self>, check_interval_ms: u64) {
        // ---
        let old = self.check_interval.swap(check_interval_ms, Ordering::AcqRel);
        if old == check_interval_ms {
            return;
        }
        let hook = self.hook.lock().clone();
        let was_active = self.is_monitoring();
        self.stop();
        if check_interval_ms == 0 {
            self.last_time.store(self.clock.now_ms(), Ordering::Release);
        } else if was_active {
            self.start(hook);
        }
    }

    // ---

    fn tick(&self) {
        // ---
        let now = self.clock.now_ms();
        self.reset_accounting(now);
        let hook = self.hook.lock().as_ref().and_then(Weak::upgrade);
        if let Some(hook) = hook {
            hook.do_accounting(self, now);
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Count `size` received bytes.
    pub fn record_read(&self, size: u64) {
        self.current_read.fetch_add(size, Ordering::AcqRel);
        self.cumulative_read.fetch_add(size, Ordering::AcqRel);
    }

    /// Count `size` bytes accepted for writing.
    pub fn record_write(&self, size: u64) {
        self.current_written.fetch_add(size, Ordering::AcqRel);
        self.cumulative_written.fetch_add(size, Ordering::AcqRel);
    }

    /// Count `size` bytes actually handed to the channel.
    pub fn record_real_write(&self, size: u64) {
        self.real_written.fetch_add(size, Ordering::AcqRel);
    }

    // -----------------------------------------------------------------------
    // Time to wait
    // -----------------------------------------------------------------------

    /// Count `size` read bytes and return how long (ms) the next read should
    /// be held off so the read rate stays under `limit` bytes/s.
    pub fn read_time_to_wait(&self, size: u64, limit: i64, max_wait: u64, now: u64) -> u64 {
        // ---
        self.record_read(size);
        if size == 0 || limit <= 0 {
            return 0;
        }
        self.time_to_wait(
            self.current_read.load(Ordering::Acquire),
            self.last_read_bytes.load(Ordering::Acquire),
            self.last_reading_time.load(Ordering::Acquire),
            &self.reading_time,
            limit,
            max_wait,
            now,
        )
    }

    // ---

    /// Count `size` bytes to write and return the delay (ms) before they
    /// may be released so the write rate stays under `limit` bytes/s.
    pub fn write_time_to_wait(&self, size: u64, limit: i64, max_wait: u64, now: u64) -> u64 {
        // ---
        self.record_write(size);
        if size == 0 || limit <= 0 {
            return 0;
        }
        self.time_to_wait(
            self.current_written.load(Ordering::Acquire),
            self.last_written_bytes.load(Ordering::Acquire),
            self.last_writing_time.load(Ordering::Acquire),
            &self.writing_time,
            limit,
            max_wait,
            now,
        )
    }

    // ---

    #[allow(clippy::too_many_arguments)]
    fn time_to_wait(
        &self,
        sum: u64,
        last_bytes: u64,
        last_release: u64,
        release: &AtomicU64,
        limit: i64,
        max_wait: u64,
        now: u64,
    ) -> u64 {
        // ---
        let limit = limit as u64;
        let last_time = self.last_time.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last_time);
        let carried = last_release.saturating_sub(last_time);

        let (sum, interval) = if elapsed > MINIMAL_WAIT {
            (sum, elapsed)
        } else {
            (sum + last_bytes, elapsed + self.check_interval())
        };

        let wanted = (sum.saturating_mul(1000) / limit + carried).saturating_sub(interval);
        if wanted > MINIMAL_WAIT {
            let wait = wanted.min(max_wait);
            release.fetch_max(now + wait, Ordering::AcqRel);
            return wait;
        }
        release.fetch_max(now, Ordering::AcqRel);
        0
    }

    // -----------------------------------------------------------------------
    // Period management
    // -----------------------------------------------------------------------

    /// Close the current period at `now`.
    pub fn reset_accounting(&self, now: u64) {
        // ---
        let last = self.last_time.load(Ordering::Acquire);
        let interval = now.saturating_sub(last);
        if interval == 0 {
            return;
        }
        self.last_time.store(now, Ordering::Release);

        let read = self.current_read.swap(0, Ordering::AcqRel);
        let written = self.current_written.swap(0, Ordering::AcqRel);
        self.last_read_bytes.store(read, Ordering::Release);
        self.last_written_bytes.store(written, Ordering::Release);
        self.last_read_throughput
            .store(read * 1000 / interval, Ordering::Release);
        self.last_write_throughput
            .store(written * 1000 / interval, Ordering::Release);

        self.last_reading_time.fetch_max(
            self.reading_time.load(Ordering::Acquire),
            Ordering::AcqRel,
        );
        self.last_writing_time.fetch_max(
            self.writing_time.load(Ordering::Acquire),
            Ordering::AcqRel,
        );
    }

    // ---

    /// Restart lifetime totals.
    pub fn reset_cumulative_time(&self) {
        self.last_cumulative_time
            .store(self.clock.now_ms(), Ordering::Release);
        self.cumulative_read.store(0, Ordering::Release);
        self.cumulative_written.store(0, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Getters
    // -----------------------------------------------------------------------

    pub fn cumulative_read_bytes(&self) -> u64 {
        self.cumulative_read.load(Ordering::Acquire)
    }

    pub fn cumulative_written_bytes(&self) -> u64 {
        self.cumulative_written.load(Ordering::Acquire)
    }

    pub fn last_read_bytes(&self) -> u64 {
        self.last_read_bytes.load(Ordering::Acquire)
    }

    pub fn last_written_bytes(&self) -> u64 {
        self.last_written_bytes.load(Ordering::Acquire)
    }

    pub fn last_time(&self) -> u64 {
        self.last_time.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        // ---
        CounterSnapshot {
            current_read: self.current_read.load(Ordering::Acquire),
            current_written: self.current_written.load(Ordering::Acquire),
            last_read_throughput: self.last_read_throughput.load(Ordering::Acquire),
            last_write_throughput: self.last_write_throughput.load(Ordering::Acquire),
            cumulative_read: self.cumulative_read_bytes(),
            cumulative_written: self.cumulative_written_bytes(),
            real_written: self.real_written.load(Ordering::Acquire),
        }
    }
}

impl Drop for TrafficCounter {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
