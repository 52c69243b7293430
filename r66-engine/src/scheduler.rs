//! [`InternalRunner`] — commander ticker plus the bounded worker pool.
//!
//! ```text
//!   ticker ──every commander_delay──▶ Commander::run_once
//!                                          │ submit(record)
//!                                          ▼
//!   RunnerHandle::submit ── capacity? ── claim key? ── permit? ──▶ spawn worker
//!            │ no               │ no           │ dup        │ no
//!            └── requeue ◀──────┘              skip         └── requeue
//! ```
//!
//! Submission never blocks: a full pool is a flow-control signal and the
//! record goes back to `ToSubmit` for a later tick.
//!
//! Shutdown is two-phase. [`InternalRunner::prepare_stop`] stops the ticker
//! and refuses new work; running transfers carry on, and
//! [`InternalRunner::drain`] waits for them. [`InternalRunner::stop`] then
//! aborts whatever is left and closes the transport.
//!
//! [`InternalRunner::reload`] lets a tick in progress run to completion
//! before the commander is replaced, so a monitor lock taken by that tick
//! is always released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

// ---

use r66_domain::{ErrorCode, Result, TransferKey, TransferRecord};

// ---

use super::commander::{Commander, DbCommander, NoDbCommander};
use super::context::{ActiveGuard, EngineContext};
use super::runner::TaskRunner;
use super::worker;

// ---------------------------------------------------------------------------
// SubmitOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A worker now owns the transfer.
    Started,
    /// Pool near capacity; flagged `ToSubmit` again.
    Requeued,
    /// The same key is already running; nothing done.
    Duplicate,
    /// The runner is stopping; flagged `ToSubmit` for the next start.
    Stopped,
}

// ---------------------------------------------------------------------------
// RunnerHandle
// ---------------------------------------------------------------------------

struct RunnerCore {
    // ---
    ctx: Arc<EngineContext>,
    running: AtomicBool,
    permits: Arc<Semaphore>,
}

/// Cheap-clone submission handle given to commanders.
#[derive(Clone)]
pub struct RunnerHandle {
    core: Arc<RunnerCore>,
}

impl RunnerHandle {
    // ---
    /// Handle over a fresh pool sized by `ctx.settings().max_workers`.
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        // ---
        let max = ctx.settings().max_workers.max(1);
        Self {
            core: Arc::new(RunnerCore {
                ctx,
                running: AtomicBool::new(true),
                permits: Arc::new(Semaphore::new(max)),
            }),
        }
    }

    // ---

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.core.ctx.active().len()
    }

    // ---

    /// Hand `record` to a worker, or put it back for a later tick.
    pub async fn submit(&self, record: TransferRecord) -> SubmitOutcome {
        // ---
        let ctx = &self.core.ctx;
        let key = record.key();

        if !self.is_running() {
            self.requeue(record).await;
            return SubmitOutcome::Stopped;
        }

        let settings = ctx.settings();
        if ctx.active().len() + settings.reserved_workers > settings.max_workers {
            tracing::warn!(%key, active = ctx.active().len(), "pool near capacity, requeued");
            self.requeue(record).await;
            return SubmitOutcome::Requeued;
        }

        if !ctx.active().try_claim(key.clone()) {
            tracing::debug!(%key, "already running, not submitted");
            return SubmitOutcome::Duplicate;
        }
        let guard = ActiveGuard::new(ctx.active().clone(), key.clone());

        let Ok(permit) = self.core.permits.clone().try_acquire_owned() else {
            drop(guard);
            tracing::warn!(%key, "no free worker, requeued");
            self.requeue(record).await;
            return SubmitOutcome::Requeued;
        };

        tracing::info!(%key, rule = %record.rule_name, "transfer submitted");
        let worker_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            worker::run_transfer(worker_ctx, record).await;
        });
        ctx.active().set_handle(&key, task.abort_handle());
        SubmitOutcome::Started
    }

    // ---

    async fn requeue(&self, record: TransferRecord) {
        let key = record.key();
        if let Err(e) = self.core.ctx.requeue(record).await {
            tracing::error!(%key, error = %e, "requeue not persisted");
        }
    }
}

// ---------------------------------------------------------------------------
// InternalRunner
// ---------------------------------------------------------------------------

struct Ticker {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl Ticker {
    fn signal_stop(&self) {
        if self.stop_tx.send(true).is_err() {
            tracing::debug!("commander ticker already exited");
        }
    }
}

pub struct InternalRunner {
    // ---
    handle: RunnerHandle,
    ticker: Mutex<Option<Ticker>>,
}

impl InternalRunner {
    // ---
    /// Build the commander for the context's store mode, run its startup
    /// recovery and start ticking.
    pub async fn new(ctx: Arc<EngineContext>) -> Self {
        // ---
        let runner = Self {
            handle: RunnerHandle::new(ctx),
            ticker: Mutex::new(None),
        };
        let commander = runner.build_commander(true).await;
        runner.spawn_ticker(commander);
        runner
    }

    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    pub fn active_count(&self) -> usize {
        self.handle.active_count()
    }

    // ---

    async fn build_commander(&self, from_startup: bool) -> Box<dyn Commander> {
        // ---
        let ctx = self.handle.core.ctx.clone();
        match ctx.store().cloned() {
            Some(store) => Box::new(
                DbCommander::new(ctx, store, self.handle.clone(), from_startup).await,
            ),
            None => Box::new(NoDbCommander::new(ctx, self.handle.clone(), from_startup).await),
        }
    }

    // ---

    fn spawn_ticker(&self, commander: Box<dyn Commander>) {
        // ---
        let delay = Duration::from_millis(self.handle.core.ctx.settings().commander_delay_ms);
        let handle = self.handle.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => break,
                }
                if !handle.is_running() {
                    break;
                }
                commander.run_once().await;
            }
            tracing::debug!("commander ticker exiting");
        });

        let old = self.ticker.lock().replace(Ticker {
            handle: task,
            stop_tx,
        });
        if let Some(old) = old {
            // Left to finish its tick; it exits at the next loop turn.
            tracing::warn!("previous commander ticker still present, signalled to stop");
            old.signal_stop();
        }
    }

    // ---

    /// Stop ticking without interrupting a tick in progress. The ticker
    /// task is detached and exits once its current tick returns.
    fn cancel_ticker(&self) {
        // ---
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.signal_stop();
        }
    }

    /// Stop ticking and wait for the current tick to finish.
    async fn join_ticker(&self) {
        // ---
        let Some(ticker) = self.ticker.lock().take() else {
            return;
        };
        ticker.signal_stop();
        match ticker.handle.await {
            Ok(()) => tracing::debug!("commander ticker joined"),
            Err(e) if e.is_panic() => tracing::error!(error = %e, "commander ticker panicked"),
            Err(e) => tracing::warn!(error = %e, "commander ticker cancelled"),
        }
    }

    /// Abort the ticker, even mid-tick.
    fn abort_ticker(&self) {
        // ---
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.signal_stop();
            ticker.handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// First shutdown phase: no more ticks, no more submissions. Running
    /// transfers continue.
    pub fn prepare_stop(&self) {
        // ---
        self.handle.core.running.store(false, Ordering::Release);
        self.handle.core.ctx.begin_shutdown();
        self.cancel_ticker();
        tracing::info!(active = self.active_count(), "runner stopping, draining workers");
    }

    // ---

    /// Wait until every worker has finished. `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        // ---
        let max = self.handle.core.ctx.settings().max_workers.max(1) as u32;
        let permits = self.handle.core.permits.clone();
        match tokio::time::timeout(timeout, permits.acquire_many_owned(max)).await {
            Ok(Ok(all)) => {
                drop(all);
                true
            }
            _ => false,
        }
    }

    // ---

    /// Second shutdown phase: abort running workers and close the network.
    pub async fn stop(&self) {
        // ---
        let ctx = &self.handle.core.ctx;
        self.handle.core.running.store(false, Ordering::Release);
        ctx.begin_shutdown();
        self.abort_ticker();

        let aborted = ctx.active().abort_all();
        ctx.shaper().release();
        ctx.transport().close().await;
        tracing::info!(aborted, "runner stopped");
    }

    // ---

    /// Replace the commander, e.g. after a configuration change. A tick in
    /// progress finishes first. Startup recovery is not run again.
    pub async fn reload(&self) {
        // ---
        self.join_ticker().await;
        let commander = self.build_commander(false).await;
        self.spawn_ticker(commander);
        tracing::info!("commander reloaded");
    }

    // ---

    /// Stop or cancel one transfer: abort its worker if live, then record
    /// the outcome. `false` if it had already finished.
    pub async fn stop_transfer(&self, key: &TransferKey, code: ErrorCode) -> Result<bool> {
        // ---
        let ctx = &self.handle.core.ctx;
        let was_running = ctx.active().abort(key);

        let record = ctx.load(key).await?;
        let rule = ctx
            .rules()
            .get(&record.rule_name)
            .unwrap_or_else(|| worker::orphan_rule(&record.rule_name));
        let mut runner = TaskRunner::new(record, rule);
        if !runner.stop_or_cancel(code) {
            return Ok(false);
        }
        ctx.save(runner.record()).await?;
        tracing::info!(%key, %code, was_running, "transfer stopped on request");
        Ok(true)
    }
}

impl Drop for InternalRunner {
    fn drop(&mut self) {
        self.abort_ticker();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
