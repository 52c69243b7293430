//! Commanders — the periodic bridge between persisted state and the
//! worker pool.
//!
//! [`DbCommander`] polls a [`r66_domain::PersistentStore`]; [`NoDbCommander`] drains the
//! in-memory FIFO fed by archive recovery. Both hand transfers to the pool
//! through [`RunnerHandle::submit`], which owns the at-most-once guard.
//!
//! # Tick (store mode)
//!
//! ```text
//!  lock monitor (HA only) ── busy? skip tick
//!       │
//!  apply changed config / host / rule rows, clear flags
//!       │
//!  query ToSubmit (≤ LIMIT_SUBMIT)
//!       │   per record: active? skip │ self-requested? Interrupted │ submit
//!       ▼
//!  release monitor
//! ```
//!
//! A store error aborts the tick only; the next tick retries.

use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;

// ---

use r66_domain::{
    // ---
    EntityKind,
    ErrorCode,
    GlobalStep,
    MonitorLock,
    StepStatus,
    StoreError,
    StoreResult,
    TransferRecord,
    UpdatedInfo,
    LIMIT_SUBMIT,
};

// ---

use super::context::{EngineContext, StorePtr, TodoItem};
use super::scheduler::RunnerHandle;

// ---------------------------------------------------------------------------
// Commander
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Commander: Send + Sync {
    /// One poll cycle. Never fails; problems are logged and retried on the
    /// next tick.
    async fn run_once(&self);
}

// ---

/// Mark a looped-back request. It will not be retried.
fn mark_self_requested(record: &mut TransferRecord) {
    // ---
    tracing::warn!(key = %record.key(), "request addressed to this host, not scheduled");
    record.updated_info = UpdatedInfo::Interrupted;
    record.info_status = ErrorCode::LoopSelfRequestedHost;
}

// ---------------------------------------------------------------------------
// DbCommander
// ---------------------------------------------------------------------------

pub struct DbCommander {
    // ---
    ctx: Arc<EngineContext>,
    store: StorePtr,
    runner: RunnerHandle,
}

impl DbCommander {
    // ---
    /// `from_startup` runs store recovery first: interrupted transfers
    /// become `ToSubmit`, completed ones `Done`.
    pub async fn new(
        ctx: Arc<EngineContext>,
        store: StorePtr,
        runner: RunnerHandle,
        from_startup: bool,
    ) -> Self {
        // ---
        if from_startup {
            match store.reset_to_submit().await {
                Ok(n) => tracing::info!(count = n, "interrupted transfers requeued"),
                Err(e) => tracing::error!(error = %e, "startup requeue failed"),
            }
            match store.change_finished_to_done().await {
                Ok(n) => tracing::info!(count = n, "finished transfers marked done"),
                Err(e) => tracing::error!(error = %e, "startup cleanup failed"),
            }
        }
        Self { ctx, store, runner }
    }

    // ---

    async fn tick(&self, lock: &mut Option<MonitorLock>) -> StoreResult<()> {
        // ---
        self.apply_updates(EntityKind::Configuration, lock).await?;
        match self.apply_updates(EntityKind::HostConfiguration, lock).await {
            Err(e @ StoreError::NoConnection(_)) => return Err(e),
            Err(e) => tracing::warn!(error = %e, "host configuration rows skipped"),
            Ok(()) => {}
        }
        self.apply_updates(EntityKind::HostAuth, lock).await?;
        self.apply_updates(EntityKind::Rule, lock).await?;

        if self.ctx.is_shutting_down() || !self.runner.is_running() {
            return Ok(());
        }

        let batch = match self.store.query_by_flag(UpdatedInfo::ToSubmit, LIMIT_SUBMIT).await {
            Err(StoreError::NoData) => Vec::new(),
            other => other?,
        };
        if !batch.is_empty() {
            tracing::debug!(count = batch.len(), "transfers to submit");
        }

        for mut record in batch {
            // ---
            if self.ctx.active().contains(&record.key()) {
                tracing::debug!(key = %record.key(), "already running, skipped");
                continue;
            }
            if record.is_self_requested(self.ctx.host_id()) {
                mark_self_requested(&mut record);
                match self.store.update_transfer(&record).await {
                    Ok(()) | Err(StoreError::NoData) => {}
                    Err(e @ StoreError::NoConnection(_)) => return Err(e),
                    Err(e) => tracing::warn!(key = %record.key(), error = %e, "row skipped"),
                }
                continue;
            }
            self.runner.submit(record).await;
        }
        Ok(())
    }

    // ---

    /// Apply every flagged row of `kind`, then clear the flags unless other
    /// instances still have to see them.
    async fn apply_updates(
        &self,
        kind: EntityKind,
        lock: &mut Option<MonitorLock>,
    ) -> StoreResult<()> {
        // ---
        let rows = match self.store.query_updated(kind).await {
            Err(StoreError::NoData) => return Ok(()),
            other => other?,
        };
        if rows.is_empty() {
            return Ok(());
        }

        for row in &rows {
            self.ctx.apply_config(&row.payload);
        }

        let clear = match lock.as_mut() {
            None => true,
            Some(l) => match kind {
                EntityKind::Configuration | EntityKind::HostConfiguration => {
                    l.check_update_config()
                }
                EntityKind::HostAuth => l.check_update_host(),
                EntityKind::Rule => l.check_update_rule(),
            },
        };
        if !clear {
            tracing::debug!(?kind, "flags left for other instances");
            return Ok(());
        }

        for mut row in rows {
            row.updated_info = UpdatedInfo::NotUpdated;
            match self.store.update_config(&row).await {
                Ok(()) | Err(StoreError::NoData) => {}
                Err(e @ StoreError::NoConnection(_)) => return Err(e),
                Err(e) => tracing::warn!(id = row.payload.id(), error = %e, "row skipped"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Commander for DbCommander {
    // ---
    async fn run_once(&self) {
        // ---
        let instances = self.ctx.settings().monitor_instances;
        let lock = if instances > 1 {
            match self.store.try_lock_monitor(self.ctx.instance(), instances).await {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    tracing::debug!("monitor held by another instance, tick skipped");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "monitor lock failed, tick skipped");
                    return;
                }
            }
        } else {
            None
        };

        let mut guard = MonitorGuard {
            store: self.store.clone(),
            lock,
        };
        if let Err(e) = self.tick(&mut guard.lock).await {
            tracing::error!(error = %e, "commander tick aborted");
        }
        guard.release().await;
    }
}

// ---

/// Monitor lock held for one tick.
///
/// Released on every exit path: a tick dropped before [`MonitorGuard::release`]
/// hands the release to a spawned task.
struct MonitorGuard {
    // ---
    store: StorePtr,
    lock: Option<MonitorLock>,
}

impl MonitorGuard {
    // ---
    async fn release(mut self) {
        // ---
        if let Some(lock) = self.lock.take() {
            release_monitor(&self.store, lock).await;
        }
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        // ---
        let Some(lock) = self.lock.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::warn!("tick cancelled while holding the monitor, releasing");
                let store = self.store.clone();
                rt.spawn(async move { release_monitor(&store, lock).await });
            }
            Err(_) => tracing::error!("tick cancelled outside the runtime, monitor not released"),
        }
    }
}

async fn release_monitor(store: &StorePtr, lock: MonitorLock) {
    if let Err(e) = store.release_monitor(lock).await {
        tracing::error!(error = %e, "monitor release failed");
    }
}

// ---------------------------------------------------------------------------
// NoDbCommander
// ---------------------------------------------------------------------------

pub struct NoDbCommander {
    // ---
    ctx: Arc<EngineContext>,
    runner: RunnerHandle,
}

impl NoDbCommander {
    // ---
    /// `from_startup` scans the archive and queues every transfer left
    /// running, interrupted or waiting.
    pub async fn new(ctx: Arc<EngineContext>, runner: RunnerHandle, from_startup: bool) -> Self {
        // ---
        if from_startup {
            Self::recover(&ctx).await;
        }
        Self { ctx, runner }
    }

    // ---

    async fn recover(ctx: &EngineContext) {
        // ---
        let records = match ctx.journal().scan().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(dir = %ctx.journal().dir().display(), error = %e, "archive scan failed");
                return;
            }
        };

        let mut queued = 0usize;
        for mut record in records {
            match record.updated_info {
                UpdatedInfo::Running | UpdatedInfo::Interrupted | UpdatedInfo::ToSubmit => {
                    if let Err(e) = ctx.requeue(record).await {
                        tracing::warn!(error = %e, "recovered transfer not requeued");
                    } else {
                        queued += 1;
                    }
                }
                UpdatedInfo::Done => {}
                _ if record.global_step == GlobalStep::AllDone
                    && record.status == StepStatus::Ok =>
                {
                    record.updated_info = UpdatedInfo::Done;
                    if let Err(e) = ctx.save(&record).await {
                        tracing::warn!(key = %record.key(), error = %e, "marker not updated");
                    }
                }
                _ => {}
            }
        }
        tracing::info!(count = queued, "transfers recovered from archive");
    }
}

#[async_trait]
impl Commander for NoDbCommander {
    // ---
    async fn run_once(&self) {
        // ---
        let spacing = Duration::from_millis(self.ctx.settings().submit_spacing_ms);

        // Only what was queued before this tick; requeued items wait.
        let pending = self.ctx.todo().len();
        for _ in 0..pending {
            if self.ctx.is_shutting_down() || !self.runner.is_running() {
                return;
            }
            let Some(item) = self.ctx.todo().pop() else {
                return;
            };

            let mut record = match item {
                TodoItem::Config(row) => {
                    self.ctx.apply_config(&row.payload);
                    continue;
                }
                TodoItem::Transfer(record) => record,
            };

            if self.ctx.active().contains(&record.key()) {
                tracing::debug!(key = %record.key(), "already running, dropped");
                continue;
            }
            if record.is_self_requested(self.ctx.host_id()) {
                mark_self_requested(&mut record);
                if let Err(e) = self.ctx.save(&record).await {
                    tracing::warn!(key = %record.key(), error = %e, "marker not updated");
                }
                continue;
            }

            self.runner.submit(record).await;
            if !spacing.is_zero() {
                tokio::time::sleep(spacing).await;
            }
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
    use crate::context::EngineSettings;
    use crate::test_support::{context_from, sender_record};
    use r66_domain::{ConfigPayload, ConfigRow, LimitConfig, Rule};
    use r66_sim::{MemoryStore, ScriptedTransport, TransportScript};

    fn quiet() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(TransportScript::succeed(1)))
    }

    #[tokio::test]
    async fn self_requested_row_is_interrupted_not_run() {
        // ---
        let transport = quiet();
        let store = Arc::new(MemoryStore::default());
        let rec = sender_record(8);
        store.put_transfer(rec.clone());

        // This host is the requested side of the row.
        let (ctx, _dir) = context_from(
            "hostb",
            EngineSettings::default(),
            transport.clone(),
            Some(store.clone()),
        );
        ctx.rules().insert(Rule::named("default"));
        let runner = RunnerHandle::new(ctx.clone());
        let commander = DbCommander::new(ctx, store.clone(), runner, false).await;
        commander.run_once().await;

        let row = store.transfer(&rec.key()).expect("row kept");
        assert_eq!(row.updated_info, UpdatedInfo::Interrupted);
        assert_eq!(row.info_status, ErrorCode::LoopSelfRequestedHost);
        assert!(row.error_message.is_none(), "looped request is not a failure");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn store_outage_aborts_the_tick_only() {
        // ---
        let store = Arc::new(MemoryStore::default());
        store.insert_row(ConfigRow::updated(ConfigPayload::Rule(Rule::named("default"))));

        let (ctx, _dir) =
            context_from("hosta", EngineSettings::default(), quiet(), Some(store.clone()));
        let runner = RunnerHandle::new(ctx.clone());
        let commander = DbCommander::new(ctx.clone(), store.clone(), runner, false).await;

        store.fail_next(StoreError::NoConnection("db down".into()));
        commander.run_once().await;
        assert!(ctx.rules().get("default").is_none(), "tick aborted before any row");

        commander.run_once().await;
        assert!(ctx.rules().get("default").is_some(), "next tick retries");
        assert_eq!(
            store.config_flag(EntityKind::Rule, "default"),
            Some(UpdatedInfo::NotUpdated)
        );
    }

    #[tokio::test]
    async fn busy_monitor_skips_the_tick() {
        // ---
        let store = Arc::new(MemoryStore::default());
        store.insert_row(ConfigRow::updated(ConfigPayload::Limits(LimitConfig {
            host_id: "hosta".into(),
            write_global_limit: 5_000,
            ..Default::default()
        })));

        let settings = EngineSettings {
            monitor_instances: 2,
            ..Default::default()
        };
        let (ctx, _dir) = context_from("hosta", settings, quiet(), Some(store.clone()));
        let runner = RunnerHandle::new(ctx.clone());
        let commander = DbCommander::new(ctx.clone(), store.clone(), runner, false).await;

        store.set_lock_busy(true);
        commander.run_once().await;
        assert_eq!(ctx.shaper().write_global_limit(), 0, "busy lock: nothing applied");

        store.set_lock_busy(false);
        commander.run_once().await;
        assert_eq!(ctx.shaper().write_global_limit(), 5_000);
        assert_eq!(
            store.config_flag(EntityKind::Configuration, "hosta"),
            Some(UpdatedInfo::ToSubmit),
            "first of two instances leaves the flag set"
        );

        commander.run_once().await;
        assert_eq!(
            store.config_flag(EntityKind::Configuration, "hosta"),
            Some(UpdatedInfo::NotUpdated),
            "second sighting clears it"
        );
    }

    #[tokio::test]
    async fn startup_recovery_requeues_interrupted_rows() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let mut stalled = sender_record(1);
        stalled.updated_info = UpdatedInfo::Interrupted;
        let mut finished = sender_record(2);
        finished.global_step = GlobalStep::AllDone;
        finished.status = StepStatus::Ok;
        finished.updated_info = UpdatedInfo::Running;
        store.put_transfer(stalled.clone());
        store.put_transfer(finished.clone());

        let (ctx, _dir) =
            context_from("hosta", EngineSettings::default(), quiet(), Some(store.clone()));
        let runner = RunnerHandle::new(ctx.clone());
        let _commander = DbCommander::new(ctx, store.clone(), runner, true).await;

        let flag = |k: &r66_domain::TransferKey| store.transfer(k).map(|r| r.updated_info);
        assert_eq!(flag(&stalled.key()), Some(UpdatedInfo::ToSubmit));
        assert_eq!(flag(&finished.key()), Some(UpdatedInfo::Done));
    }

    #[tokio::test]
    async fn store_less_tick_drains_only_what_was_queued() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::refuse(
            ErrorCode::ConnectionImpossible,
        )));
        let settings = EngineSettings {
            submit_spacing_ms: 0,
            ..Default::default()
        };
        let (ctx, _dir) = context_from("hosta", settings, transport.clone(), None);
        ctx.rules().insert(Rule::named("default"));

        let runner = RunnerHandle::new(ctx.clone());
        let commander = NoDbCommander::new(ctx.clone(), runner, false).await;
        ctx.todo().push(TodoItem::Config(ConfigRow::updated(ConfigPayload::Rule(
            Rule::named("extra"),
        ))));
        ctx.submit_request(sender_record(5)).await.unwrap();

        commander.run_once().await;
        assert!(ctx.rules().get("extra").is_some(), "config item applied");
        assert!(ctx.todo().is_empty(), "both items consumed in one tick");
    }
}
