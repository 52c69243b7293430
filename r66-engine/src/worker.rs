//! One transfer, start to finish, on a pool worker.
//!
//! ```text
//!  restart ─▶ PreTask ─▶ TransferTask ─▶ PostTask ─▶ AllDone
//!                 │            │             │
//!                 └─ task / io failure ──────┴─▶ ErrorTask ─▶ InError
//!                              │                     └─ heals ─▶ AllDone
//!                              ├─ connectivity ─▶ ToSubmit (rank kept)
//!                              └─ business ─────▶ InError
//! ```
//!
//! Every stage boundary is persisted. A worker aborted mid-stage leaves the
//! record `Running`; startup recovery turns that back into `ToSubmit`.

use std::sync::Arc;

// ---

use r66_domain::{
    // ---
    BlockProgress,
    ErrorCode,
    GlobalStep,
    R66Error,
    Rule,
    Stage,
    StepStatus,
    TransferRecord,
    TransportError,
    UpdatedInfo,
};

// ---

use super::context::EngineContext;
use super::runner::TaskRunner;

// ---------------------------------------------------------------------------
// run_transfer
// ---------------------------------------------------------------------------

/// Drive `record` to a resting state: done, failed, or requeued.
pub async fn run_transfer(ctx: Arc<EngineContext>, record: TransferRecord) {
    // ---
    let key = record.key();

    let Some(rule) = ctx.rules().get(&record.rule_name) else {
        let mut record = record;
        tracing::error!(%key, rule = %record.rule_name, "no such rule");
        record.mark_failed(
            ErrorCode::QueryRemotelyUnknown,
            format!("no such rule: {}", record.rule_name),
        );
        record.updated_info = UpdatedInfo::InError;
        persist(&ctx, &record).await;
        return;
    };

    let mut runner = TaskRunner::new(record, rule);
    let margin = ctx.settings().rank_restart;
    if !runner.restart(false, ctx.host_id(), margin) {
        tracing::info!(%key, "transfer already finished");
        persist(&ctx, runner.record()).await;
        return;
    }
    runner.record_mut().info_status = match runner.record().info_status {
        ErrorCode::Unknown => ErrorCode::Running,
        other => other,
    };
    persist(&ctx, runner.record()).await;
    tracing::info!(%key, step = %runner.record().global_step, rank = runner.record().rank, "transfer started");

    match drive(&ctx, &mut runner).await {
        Ok(()) => {
            tracing::info!(%key, file = %runner.record().filename, "transfer complete");
            persist(&ctx, runner.record()).await;
        }
        Err(R66Error::Transport(TransportError::Connectivity(reason))) => {
            tracing::warn!(%key, rank = runner.record().rank, %reason, "peer unreachable, requeued");
            if let Err(e) = ctx.requeue(runner.into_record()).await {
                tracing::error!(%key, error = %e, "requeue not persisted");
            }
        }
        Err(R66Error::Transport(TransportError::Business { code, reason })) => {
            tracing::error!(%key, %code, %reason, "transfer refused");
            let rec = runner.record_mut();
            rec.mark_failed(code, reason);
            rec.updated_info = UpdatedInfo::InError;
            persist(&ctx, runner.record()).await;
        }
        Err(e) => {
            tracing::error!(%key, step = %runner.record().global_step, error = %e, "transfer failed");
            if !runner.record().is_terminal_failure() {
                let code = match &e {
                    R66Error::Runner(r) => r.code(),
                    R66Error::Transport(_) => ErrorCode::TransferError,
                    _ => ErrorCode::Internal,
                };
                runner.record_mut().mark_failed(code, e.to_string());
            }
            run_error_stage(&ctx, &mut runner).await;
        }
    }
}

// ---

async fn drive(ctx: &EngineContext, runner: &mut TaskRunner) -> Result<(), R66Error> {
    // ---
    loop {
        match runner.record().global_step {
            GlobalStep::NoTask => runner.set_pre_task(0)?,
            GlobalStep::PreTask => {
                runner.run(ctx).await?;
                let rank = runner.record().rank;
                runner.set_transfer_task(rank)?;
                persist(ctx, runner.record()).await;
            }
            GlobalStep::TransferTask => {
                transfer_stage(ctx, runner).await?;
                runner.set_post_task(0)?;
                persist(ctx, runner.record()).await;
            }
            GlobalStep::PostTask => {
                runner.run(ctx).await?;
                runner.set_all_done()?;
                return Ok(());
            }
            GlobalStep::ErrorTask | GlobalStep::AllDone => return Ok(()),
        }
    }
}

// ---

async fn transfer_stage(ctx: &EngineContext, runner: &mut TaskRunner) -> Result<(), R66Error> {
    // ---
    let progress = BlockProgress::new(runner.record().rank);
    let result = ctx
        .transport()
        .transfer(runner.record(), &progress)
        .await;
    runner.record_mut().rank = progress.rank();

    match result {
        Ok(delivered) => {
            if let Some(path) = delivered {
                runner.record_mut().filename = path;
            }
            let rank = runner.finish_transfer_task(true);
            tracing::debug!(key = %runner.record().key(), rank, "data stage complete");
            Ok(())
        }
        Err(e) => {
            runner.finish_transfer_task(false);
            Err(e.into())
        }
    }
}

// ---

/// Run the rule's error tasks. If there are any and they all succeed, the
/// transfer is healed to `AllDone`; otherwise it ends `InError`.
async fn run_error_stage(ctx: &EngineContext, runner: &mut TaskRunner) {
    // ---
    let key = runner.record().key();
    let has_tasks = !runner
        .rule()
        .tasks(runner.record().is_sender, Stage::Error)
        .is_empty();

    // The failure cause survives the error stage for the admin view.
    let cause = (runner.record().info_status, runner.record().error_message.clone());

    let healed = match runner.set_error_task(0) {
        Ok(()) if has_tasks => match runner.run(ctx).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%key, error = %e, "error tasks failed");
                false
            }
        },
        Ok(()) => false,
        Err(e) => {
            tracing::error!(%key, error = %e, "cannot enter error stage");
            false
        }
    };

    let rec = runner.record_mut();
    rec.info_status = cause.0;
    rec.error_message = cause.1;

    if healed && runner.set_all_done().is_ok() {
        tracing::warn!(%key, "transfer healed by its error tasks");
    } else {
        let rec = runner.record_mut();
        rec.status = StepStatus::Error;
        rec.updated_info = UpdatedInfo::InError;
        if rec.error_message.is_none() {
            rec.error_message = Some(format!("transfer failed ({})", rec.info_status));
        }
    }
    persist(ctx, runner.record()).await;
}

// ---

async fn persist(ctx: &EngineContext, record: &TransferRecord) {
    if let Err(e) = ctx.save(record).await {
        tracing::error!(key = %record.key(), error = %e, "transfer state not persisted");
    }
}

// ---

/// Rule used when stopping a transfer whose rule is gone.
pub(crate) fn orphan_rule(name: &str) -> Arc<Rule> {
    Arc::new(Rule::named(name))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::{context_with, sender_record};
    use r66_domain::{TaskKind, TaskSpec};
    use r66_sim::{ScriptedTransport, TransportScript};

    #[tokio::test]
    async fn happy_path_reaches_all_done() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::succeed(3)));
        let (ctx, store, _dir) = context_with("hosta", transport.clone());
        ctx.rules().insert(Rule::named("default"));

        let rec = sender_record(1);
        run_transfer(ctx.clone(), rec.clone()).await;

        let done = store.transfer(&rec.key()).unwrap();
        assert_eq!(done.global_step, GlobalStep::AllDone);
        assert_eq!(done.status, StepStatus::Ok);
        assert_eq!(done.updated_info, UpdatedInfo::Done);
        assert_eq!(done.info_status, ErrorCode::CompleteOk);
        assert_eq!(done.rank, 3, "rank reflects acknowledged blocks");
    }

    #[tokio::test]
    async fn connectivity_failure_requeues_with_rank() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::drop_after(4)));
        let (ctx, store, _dir) = context_with("hosta", transport);
        ctx.rules().insert(Rule::named("default"));

        let rec = sender_record(2);
        run_transfer(ctx.clone(), rec.clone()).await;

        let stalled = store.transfer(&rec.key()).unwrap();
        assert_eq!(stalled.updated_info, UpdatedInfo::ToSubmit);
        assert_eq!(stalled.global_step, GlobalStep::TransferTask);
        assert_eq!(stalled.rank, 4);
        assert!(!stalled.is_terminal_failure(), "stalled transfer carries no failure");
    }

    #[tokio::test]
    async fn business_refusal_is_terminal() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::refuse(
            ErrorCode::NotAuthenticated,
        )));
        let (ctx, store, _dir) = context_with("hosta", transport);
        ctx.rules().insert(Rule::named("default"));

        let rec = sender_record(3);
        run_transfer(ctx.clone(), rec.clone()).await;

        let failed = store.transfer(&rec.key()).unwrap();
        assert_eq!(failed.updated_info, UpdatedInfo::InError);
        assert_eq!(failed.info_status, ErrorCode::NotAuthenticated);
        assert!(failed.is_terminal_failure());
    }

    #[tokio::test]
    async fn failing_pre_task_without_error_tasks_ends_in_error() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::succeed(1)));
        let (ctx, store, _dir) = context_with("hosta", transport.clone());
        let mut rule = Rule::named("default");
        rule.send_pre = vec![TaskSpec::new(TaskKind::Delete, "", 0)];
        ctx.rules().insert(rule);

        let rec = sender_record(4);
        run_transfer(ctx.clone(), rec.clone()).await;

        let failed = store.transfer(&rec.key()).unwrap();
        assert_eq!(failed.global_step, GlobalStep::ErrorTask);
        assert_eq!(failed.global_last_step, GlobalStep::PreTask);
        assert_eq!(failed.updated_info, UpdatedInfo::InError);
        assert_eq!(failed.info_status, ErrorCode::FileNotFound);
        assert!(failed.is_terminal_failure());
        assert!(transport.start_ranks().is_empty(), "data stage never ran");
    }

    #[tokio::test]
    async fn error_tasks_heal_the_transfer() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::succeed(1)));
        let (ctx, store, _dir) = context_with("hosta", transport);
        let mut rule = Rule::named("default");
        rule.send_post = vec![TaskSpec::new(TaskKind::Delete, "", 0)];
        rule.send_error = vec![TaskSpec::new(TaskKind::Test, "cleanup #TRANSFERID#", 0)];
        ctx.rules().insert(rule);

        let rec = sender_record(5);
        run_transfer(ctx.clone(), rec.clone()).await;

        let healed = store.transfer(&rec.key()).unwrap();
        assert_eq!(healed.global_step, GlobalStep::AllDone);
        assert_eq!(healed.status, StepStatus::Ok);
        assert_eq!(healed.updated_info, UpdatedInfo::Done);
        assert_eq!(
            healed.info_status,
            ErrorCode::FileNotFound,
            "healed transfer keeps the original cause"
        );
    }

    #[tokio::test]
    async fn unknown_rule_is_terminal() {
        // ---
        let transport = Arc::new(ScriptedTransport::new(TransportScript::succeed(1)));
        let (ctx, store, _dir) = context_with("hosta", transport);

        let rec = sender_record(6);
        run_transfer(ctx.clone(), rec.clone()).await;

        let failed = store.transfer(&rec.key()).unwrap();
        assert_eq!(failed.info_status, ErrorCode::QueryRemotelyUnknown);
        assert_eq!(failed.updated_info, UpdatedInfo::InError);
    }
}
