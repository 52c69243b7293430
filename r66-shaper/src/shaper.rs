//! [`GlobalChannelShaper`] — one global limit, one limit per channel, and a
//! fairness correction between channels.
//!
//! ## Read path
//!
//! A read is always delivered.  What the shaper delays is the *next* read:
//! when the computed wait reaches [`MINIMAL_WAIT`] it turns auto-read off
//! and schedules a one-shot task that turns it back on.
//!
//! ## Write path
//!
//! ```text
//! on_write ──► wait < MINIMAL_WAIT && queue empty ──► channel.write
//!    │
//!    └──► push (release_at = now + wait) ──► spawn flush after `wait`
//!                                                 │
//!          pop every due entry from the front ◄───┘
//! ```
//!
//! Each queued entry schedules its own flush, and a flush only ever pops
//! from the front, so a channel's writes leave in submission order even
//! when their individual delays differ.
//!
//! ## Deviation balancing
//!
//! On every accounting tick the shaper compares cumulative bytes across
//! channels.  If more than one channel is open and the slowest has less than
//! half of the fastest, balancing turns on for that direction and each
//! channel's own wait is scaled by [`Deviation::balanced_wait`].

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::oneshot;

// ---

use super::channel::{PerChannel, ToSend};
use super::{
    // ---
    AccountingHook,
    ChannelId,
    ChannelPtr,
    Clock,
    CounterSnapshot,
    ShaperError,
    TrafficCounter,
    WriteReceipt,
    MINIMAL_WAIT,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_TIME: u64 = 15_000;

/// Per-channel queue size above which the channel is marked not writable.
pub const DEFAULT_MAX_SIZE: u64 = 4 * 1024 * 1024;

/// Per-channel delay above which the channel is marked not writable.
pub const DEFAULT_MAX_WRITE_DELAY: u64 = 4_000;

pub const DEFAULT_MAX_GLOBAL_WRITE_SIZE: u64 = DEFAULT_MAX_SIZE * 100;

pub const DEFAULT_DEVIATION: f64 = 0.1;

/// Deviation settings above this are ignored.
pub const MAX_DEVIATION: f64 = 0.4;

// ---------------------------------------------------------------------------
// ShaperConfig
// ---------------------------------------------------------------------------

/// Construction parameters. Limits are bytes/s; `<= 0` means unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaperConfig {
    // ---
    pub write_global_limit: i64,
    pub read_global_limit: i64,
    pub write_channel_limit: i64,
    pub read_channel_limit: i64,
    /// Accounting period in ms; `0` disables periodic accounting.
    pub check_interval_ms: u64,
    pub max_time_to_wait_ms: u64,
    pub max_global_write_size: u64,
    pub max_write_size: u64,
    pub max_write_delay_ms: u64,
    pub max_deviation: f64,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        // ---
        Self {
            write_global_limit: 0,
            read_global_limit: 0,
            write_channel_limit: 0,
            read_channel_limit: 0,
            check_interval_ms: 1_000,
            max_time_to_wait_ms: DEFAULT_MAX_TIME,
            max_global_write_size: DEFAULT_MAX_GLOBAL_WRITE_SIZE,
            max_write_size: DEFAULT_MAX_SIZE,
            max_write_delay_ms: DEFAULT_MAX_WRITE_DELAY,
            max_deviation: DEFAULT_DEVIATION,
        }
    }
}

// ---------------------------------------------------------------------------
// Deviation
// ---------------------------------------------------------------------------

/// Fairness parameters derived from `max_deviation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deviation {
    pub max_deviation: f64,
    /// Multiplier for channels far ahead: `1 + 4 * max_deviation`.
    pub slow_down: f64,
    /// Multiplier for channels far behind: `1 - max_deviation`.
    pub accelerate: f64,
}

impl Deviation {
    // ---
    pub fn new(max_deviation: f64) -> Self {
        Self {
            max_deviation,
            slow_down: 1.0 + 4.0 * max_deviation,
            accelerate: 1.0 - max_deviation,
        }
    }

    // ---

    /// Scale `wait` by how far `local` cumulative bytes sit from the
    /// group maximum `global`.
    ///
    /// ```text
    /// ratio = local / global
    ///   ratio <= max_deviation              → wait * accelerate
    ///   max_deviation < ratio < accelerate  → wait
    ///   ratio >= accelerate                 → max(wait, MINIMAL_WAIT) * slow_down
    /// ```
    pub fn balanced_wait(&self, local: u64, global: u64, wait: u64) -> u64 {
        // ---
        if global == 0 {
            return wait;
        }
        let ratio = local as f64 / global as f64;

        let (wait, factor) = if ratio > self.max_deviation {
            if ratio < self.accelerate {
                return wait;
            }
            (wait.max(MINIMAL_WAIT), self.slow_down)
        } else {
            (wait, self.accelerate)
        };
        (wait as f64 * factor) as u64
    }
}

impl Default for Deviation {
    fn default() -> Self {
        Self::new(DEFAULT_DEVIATION)
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Live-updatable settings.
struct Limits {
    write_global: AtomicI64,
    read_global: AtomicI64,
    write_channel: AtomicI64,
    read_channel: AtomicI64,
    max_time: AtomicU64,
    max_global_write_size: AtomicU64,
    max_write_size: AtomicU64,
    max_write_delay: AtomicU64,
}

impl Limits {
    fn get(v: &AtomicI64) -> i64 {
        v.load(Ordering::Relaxed)
    }

    fn get_u(v: &AtomicU64) -> u64 {
        v.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// GlobalChannelShaper
// ---------------------------------------------------------------------------

pub struct GlobalChannelShaper {
    // ---
    clock: Clock,
    global: Arc<TrafficCounter>,
    channels: DashMap<ChannelId, Arc<PerChannel>>,
    limits: Limits,
    deviation: RwLock<Deviation>,

    /// Bytes queued across every channel.
    queues_size: AtomicU64,

    // Refreshed on each accounting tick.
    max_cumulative_written: AtomicU64,
    max_cumulative_read: AtomicU64,
    read_deviation_active: AtomicBool,
    write_deviation_active: AtomicBool,
}

impl GlobalChannelShaper {
    // ---
    pub fn new(config: ShaperConfig) -> Arc<Self> {
        // ---
        let clock = Clock::new();
        let deviation = if (0.0..=MAX_DEVIATION).contains(&config.max_deviation) {
            Deviation::new(config.max_deviation)
        } else {
            tracing::warn!(
                max_deviation = config.max_deviation,
                "max deviation out of range, using default"
            );
            Deviation::default()
        };

        Arc::new(Self {
            clock,
            global: Arc::new(TrafficCounter::new("global", config.check_interval_ms, clock)),
            channels: DashMap::new(),
            limits: Limits {
                write_global: AtomicI64::new(config.write_global_limit),
                read_global: AtomicI64::new(config.read_global_limit),
                write_channel: AtomicI64::new(config.write_channel_limit),
                read_channel: AtomicI64::new(config.read_channel_limit),
                max_time: AtomicU64::new(config.max_time_to_wait_ms),
                max_global_write_size: AtomicU64::new(config.max_global_write_size),
                max_write_size: AtomicU64::new(config.max_write_size),
                max_write_delay: AtomicU64::new(config.max_write_delay_ms),
            },
            deviation: RwLock::new(deviation),
            queues_size: AtomicU64::new(0),
            max_cumulative_written: AtomicU64::new(0),
            max_cumulative_read: AtomicU64::new(0),
            read_deviation_active: AtomicBool::new(false),
            write_deviation_active: AtomicBool::new(false),
        })
    }

    // ---

    /// Start periodic accounting on the global counter.
    pub fn start(self: &Arc<Self>) {
        // ---
        let me: Weak<GlobalChannelShaper> = Arc::downgrade(self);
        let hook: Weak<dyn AccountingHook> = me;
        self.global.start(Some(hook));
    }

    // ---

    /// Stop accounting and drop every queued write.
    pub fn release(&self) {
        // ---
        self.global.stop();
        let ids: Vec<ChannelId> = self.channels.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, per)) = self.channels.remove(&id) {
                let mut st = per.state.lock();
                for item in st.queue.drain(..) {
                    let _ = item.promise.send(Err(ShaperError::ChannelClosed));
                }
                st.queue_size = 0;
            }
        }
        self.queues_size.store(0, Ordering::Release);
        tracing::debug!("traffic shaper released");
    }

    // -----------------------------------------------------------------------
    // Channel lifecycle
    // -----------------------------------------------------------------------

    pub fn channel_open(&self, channel: &ChannelPtr) {
        // ---
        let id = channel.id();
        let check = self.global.check_interval();
        let clock = self.clock;
        self.channels
            .entry(id)
            .or_insert_with(|| Arc::new(PerChannel::new(id, check, clock)));
        tracing::trace!(channel = id, "shaping entry created");
    }

    // ---

    /// Remove the channel's entry.  Queued writes are flushed if the
    /// channel is still active, failed with `ChannelClosed` otherwise.
    pub fn channel_closed(&self, channel: &ChannelPtr) {
        // ---
        let id = channel.id();
        let Some((_, per)) = self.channels.remove(&id) else {
            return;
        };
        let active = channel.is_active();
        {
            let mut st = per.state.lock();
            while let Some(item) = st.queue.pop_front() {
                let result = if active {
                    self.write_through(channel, &per, item.payload, item.size)
                } else {
                    Err(ShaperError::ChannelClosed)
                };
                let _ = item.promise.send(result);
            }
            self.queues_size.fetch_sub(st.queue_size, Ordering::AcqRel);
            st.queue_size = 0;
        }
        if active {
            let _ = channel.flush();
            channel.set_user_writable(true);
            per.read_suspended.store(false, Ordering::Release);
            channel.set_auto_read(true);
        }
        tracing::trace!(channel = id, active, "shaping entry removed");
    }

    // ---

    /// Existing entry, or a new one for a channel that is still active.
    fn per_channel(&self, channel: &ChannelPtr) -> Option<Arc<PerChannel>> {
        // ---
        let id = channel.id();
        if let Some(per) = self.channels.get(&id) {
            return Some(per.clone());
        }
        if !channel.is_active() {
            return None;
        }
        self.channel_open(channel);
        self.channels.get(&id).map(|per| per.clone())
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Account an incoming message and, if needed, hold off the next read.
    /// The message itself is always handed back for delivery.
    pub fn on_read(self: &Arc<Self>, channel: &ChannelPtr, msg: Bytes) -> Bytes {
        // ---
        let size = msg.len() as u64;
        if size == 0 {
            return msg;
        }
        let now = self.clock.now_ms();
        let max_time = Limits::get_u(&self.limits.max_time);
        let per = self.per_channel(channel);

        let mut wait = self.global.read_time_to_wait(
            size,
            Limits::get(&self.limits.read_global),
            max_time,
            now,
        );

        if let Some(per) = &per {
            let raw = per.counter.read_time_to_wait(
                size,
                Limits::get(&self.limits.read_channel),
                max_time,
                now,
            );
            wait = wait.max(self.balance_read(per, raw));

            let mut st = per.state.lock();
            wait = clamp_wait(wait, max_time, now, st.last_read);
            st.last_read = now;
        }

        if wait >= MINIMAL_WAIT && channel.is_auto_read() {
            channel.set_auto_read(false);
            if let Some(per) = &per {
                per.read_suspended.store(true, Ordering::Release);
            }
            tracing::debug!(channel = channel.id(), wait, "read suspended");
            self.schedule_reopen(channel.clone(), wait);
        }
        msg
    }

    // ---

    fn schedule_reopen(self: &Arc<Self>, channel: ChannelPtr, wait: u64) {
        // ---
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait)).await;
            let Some(shaper) = weak.upgrade() else {
                return;
            };
            if !channel.is_active() {
                return;
            }
            if let Some(per) = shaper.channels.get(&channel.id()) {
                per.read_suspended.store(false, Ordering::Release);
            }
            channel.set_auto_read(true);
            tracing::trace!(channel = channel.id(), "read resumed");
        });
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Submit a write.  The receipt resolves once the payload reaches the
    /// channel.
    pub fn on_write(self: &Arc<Self>, channel: &ChannelPtr, payload: Bytes) -> WriteReceipt {
        // ---
        let (promise, receipt) = WriteReceipt::new();
        let size = payload.len() as u64;
        let now = self.clock.now_ms();
        let max_time = Limits::get_u(&self.limits.max_time);

        let mut wait = if size > 0 {
            self.global.write_time_to_wait(
                size,
                Limits::get(&self.limits.write_global),
                max_time,
                now,
            )
        } else {
            0
        };

        let Some(per) = self.per_channel(channel) else {
            // Closed under us: only the global limit applies.
            self.write_unqueued(channel.clone(), payload, wait, promise);
            return receipt;
        };

        if size > 0 {
            let raw = per.counter.write_time_to_wait(
                size,
                Limits::get(&self.limits.write_channel),
                max_time,
                now,
            );
            wait = wait.max(self.balance_write(&per, raw));
        }

        self.submit_write(channel, per, payload, size, wait, now, promise);
        receipt
    }

    // ---

    #[allow(clippy::too_many_arguments)]
    fn submit_write(
        self: &Arc<Self>,
        channel: &ChannelPtr,
        per: Arc<PerChannel>,
        payload: Bytes,
        size: u64,
        wait: u64,
        now: u64,
        promise: oneshot::Sender<Result<(), ShaperError>>,
    ) {
        // ---
        let max_time = Limits::get_u(&self.limits.max_time);
        let (wait, queue_size) = {
            let mut st = per.state.lock();
            if wait < MINIMAL_WAIT && st.queue.is_empty() {
                let result = self.write_through(channel, &per, payload, size);
                st.last_write = now;
                drop(st);
                let _ = promise.send(result);
                return;
            }

            let wait = clamp_wait(wait, max_time, now, st.last_write);
            st.queue.push_back(ToSend {
                release_at: now + wait,
                payload,
                size,
                promise,
            });
            st.queue_size += size;
            (wait, st.queue_size)
        };

        let global_size = self.queues_size.fetch_add(size, Ordering::AcqRel) + size;
        self.check_write_suspend(channel, wait, queue_size);
        if global_size > Limits::get_u(&self.limits.max_global_write_size) {
            tracing::debug!(channel = channel.id(), global_size, "global write queue over cap");
            channel.set_user_writable(false);
        }

        let weak = Arc::downgrade(self);
        let channel = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait)).await;
            if let Some(shaper) = weak.upgrade() {
                shaper.send_all_valid(&channel, &per);
            }
        });
    }

    // ---

    /// Flush every due entry from the front of the channel's queue.
    fn send_all_valid(&self, channel: &ChannelPtr, per: &Arc<PerChannel>) {
        // ---
        if !self.channels.contains_key(&channel.id()) {
            return;
        }
        let now = self.clock.now_ms();
        let mut st = per.state.lock();
        while st.queue.front().is_some_and(|front| front.release_at <= now) {
            let Some(item) = st.queue.pop_front() else {
                break;
            };
            st.queue_size -= item.size;
            self.queues_size.fetch_sub(item.size, Ordering::AcqRel);
            let result = self.write_through(channel, per, item.payload, item.size);
            st.last_write = now;
            let _ = item.promise.send(result);
        }
        let drained = st.queue.is_empty();
        drop(st);

        if drained {
            channel.set_user_writable(true);
        }
        if let Err(e) = channel.flush() {
            tracing::warn!(channel = channel.id(), "flush failed: {e}");
        }
    }

    // ---

    fn write_unqueued(
        self: &Arc<Self>,
        channel: ChannelPtr,
        payload: Bytes,
        wait: u64,
        promise: oneshot::Sender<Result<(), ShaperError>>,
    ) {
        // ---
        let size = payload.len() as u64;
        if wait < MINIMAL_WAIT {
            self.global.record_real_write(size);
            let _ = promise.send(channel.write(payload).map_err(ShaperError::from));
            return;
        }
        let global = self.global.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait)).await;
            global.record_real_write(size);
            let _ = promise.send(channel.write(payload).map_err(ShaperError::from));
        });
    }

    // ---

    fn write_through(
        &self,
        channel: &ChannelPtr,
        per: &PerChannel,
        payload: Bytes,
        size: u64,
    ) -> Result<(), ShaperError> {
        // ---
        self.global.record_real_write(size);
        per.counter.record_real_write(size);
        channel.write(payload).map_err(ShaperError::from)
    }

    // ---

    fn check_write_suspend(&self, channel: &ChannelPtr, wait: u64, queue_size: u64) {
        // ---
        if queue_size > Limits::get_u(&self.limits.max_write_size)
            || wait > Limits::get_u(&self.limits.max_write_delay)
        {
            tracing::debug!(channel = channel.id(), queue_size, wait, "channel write suspended");
            channel.set_user_writable(false);
        }
    }

    // -----------------------------------------------------------------------
    // Balancing
    // -----------------------------------------------------------------------

    fn balance_read(&self, per: &PerChannel, wait: u64) -> u64 {
        // ---
        if !self.read_deviation_active.load(Ordering::Acquire) {
            return wait;
        }
        let local = per.counter.cumulative_read_bytes();
        let global = self.max_cumulative_read.load(Ordering::Acquire).max(local);
        self.deviation.read().balanced_wait(local, global, wait)
    }

    fn balance_write(&self, per: &PerChannel, wait: u64) -> u64 {
        // ---
        if !self.write_deviation_active.load(Ordering::Acquire) {
            return wait;
        }
        let local = per.counter.cumulative_written_bytes();
        let global = self.max_cumulative_written.load(Ordering::Acquire).max(local);
        self.deviation.read().balanced_wait(local, global, wait)
    }

    // ---

    /// Scan every channel's cumulative bytes and decide, per direction,
    /// whether balancing is on.
    fn compute_deviation_cumulative_bytes(&self) {
        // ---
        let mut max_written = 0_u64;
        let mut max_read = 0_u64;
        let mut min_written = u64::MAX;
        let mut min_read = u64::MAX;
        let mut count = 0_usize;

        for entry in self.channels.iter() {
            let counter = &entry.value().counter;
            let written = counter.cumulative_written_bytes();
            let read = counter.cumulative_read_bytes();
            max_written = max_written.max(written);
            min_written = min_written.min(written);
            max_read = max_read.max(read);
            min_read = min_read.min(read);
            count += 1;
        }

        let multiple = count > 1;
        self.read_deviation_active
            .store(multiple && min_read < max_read / 2, Ordering::Release);
        self.write_deviation_active
            .store(multiple && min_written < max_written / 2, Ordering::Release);
        self.max_cumulative_written.store(max_written, Ordering::Release);
        self.max_cumulative_read.store(max_read, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Runtime configuration
    // -----------------------------------------------------------------------

    /// Change global limits and the accounting period.
    pub fn configure(self: &Arc<Self>, write_global: i64, read_global: i64, check_interval_ms: u64) {
        // ---
        self.limits.write_global.store(write_global, Ordering::Relaxed);
        self.limits.read_global.store(read_global, Ordering::Relaxed);
        self.global.reset_accounting(self.clock.now_ms());
        self.global.configure(check_interval_ms);
        tracing::info!(write_global, read_global, check_interval_ms, "global limits changed");
    }

    pub fn set_write_global_limit(&self, limit: i64) {
        self.limits.write_global.store(limit, Ordering::Relaxed);
        self.global.reset_accounting(self.clock.now_ms());
    }

    pub fn set_read_global_limit(&self, limit: i64) {
        self.limits.read_global.store(limit, Ordering::Relaxed);
        self.global.reset_accounting(self.clock.now_ms());
    }

    // ---

    /// Change both channel limits; every channel's period restarts.
    pub fn configure_channel(&self, write_channel: i64, read_channel: i64) {
        // ---
        self.limits.write_channel.store(write_channel, Ordering::Relaxed);
        self.limits.read_channel.store(read_channel, Ordering::Relaxed);
        self.reset_channel_accounting();
        tracing::info!(write_channel, read_channel, "channel limits changed");
    }

    pub fn set_write_channel_limit(&self, limit: i64) {
        self.limits.write_channel.store(limit, Ordering::Relaxed);
        self.reset_channel_accounting();
    }

    pub fn set_read_channel_limit(&self, limit: i64) {
        self.limits.read_channel.store(limit, Ordering::Relaxed);
        self.reset_channel_accounting();
    }

    fn reset_channel_accounting(&self) {
        let now = self.clock.now_ms();
        for entry in self.channels.iter() {
            entry.value().counter.reset_accounting(now);
        }
    }

    // ---

    pub fn set_check_interval(self: &Arc<Self>, check_interval_ms: u64) {
        self.global.configure(check_interval_ms);
    }

    pub fn set_max_time_to_wait(&self, max_ms: u64) {
        self.limits.max_time.store(max_ms, Ordering::Relaxed);
    }

    pub fn set_max_global_write_size(&self, size: u64) {
        self.limits.max_global_write_size.store(size, Ordering::Relaxed);
    }

    pub fn set_max_write_size(&self, size: u64) {
        self.limits.max_write_size.store(size, Ordering::Relaxed);
    }

    pub fn set_max_write_delay(&self, delay_ms: u64) {
        self.limits.max_write_delay.store(delay_ms, Ordering::Relaxed);
    }

    // ---

    /// Set the deviation tolerance.  Values outside `[0, 0.4]` are ignored;
    /// returns whether the value was applied.
    pub fn set_max_deviation(&self, max_deviation: f64) -> bool {
        // ---
        if !(0.0..=MAX_DEVIATION).contains(&max_deviation) {
            tracing::debug!(max_deviation, "max deviation ignored");
            return false;
        }
        *self.deviation.write() = Deviation::new(max_deviation);
        true
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn deviation(&self) -> Deviation {
        *self.deviation.read()
    }

    pub fn queues_size(&self) -> u64 {
        self.queues_size.load(Ordering::Acquire)
    }

    pub fn max_global_write_size(&self) -> u64 {
        Limits::get_u(&self.limits.max_global_write_size)
    }

    pub fn write_channel_limit(&self) -> i64 {
        Limits::get(&self.limits.write_channel)
    }

    pub fn read_channel_limit(&self) -> i64 {
        Limits::get(&self.limits.read_channel)
    }

    pub fn write_global_limit(&self) -> i64 {
        Limits::get(&self.limits.write_global)
    }

    pub fn read_global_limit(&self) -> i64 {
        Limits::get(&self.limits.read_global)
    }

    pub fn check_interval(&self) -> u64 {
        self.global.check_interval()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_read_deviation_active(&self) -> bool {
        self.read_deviation_active.load(Ordering::Acquire)
    }

    pub fn is_write_deviation_active(&self) -> bool {
        self.write_deviation_active.load(Ordering::Acquire)
    }

    pub fn global_snapshot(&self) -> CounterSnapshot {
        self.global.snapshot()
    }

    pub fn channel_snapshot(&self, id: ChannelId) -> Option<CounterSnapshot> {
        self.channels.get(&id).map(|per| per.counter.snapshot())
    }

    /// Bytes queued on one channel.
    pub fn channel_queue_size(&self, id: ChannelId) -> Option<u64> {
        self.channels.get(&id).map(|per| per.state.lock().queue_size)
    }
}

// ---

impl AccountingHook for GlobalChannelShaper {
    fn do_accounting(&self, _counter: &TrafficCounter, now: u64) {
        // ---
        for entry in self.channels.iter() {
            entry.value().counter.reset_accounting(now);
        }
        self.compute_deviation_cumulative_bytes();
    }
}

impl Drop for GlobalChannelShaper {
    fn drop(&mut self) {
        self.global.stop();
    }
}

// ---

/// Never let a single wait push past `max_time` since the last operation.
fn clamp_wait(wait: u64, max_time: u64, now: u64, last: u64) -> u64 {
    if wait > max_time && (now + wait).saturating_sub(last) > max_time {
        return max_time;
    }
    wait
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
