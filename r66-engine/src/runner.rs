//! [`TaskRunner`] — drives one transfer record through its stages.
//!
//! ```text
//!   NoTask ──▶ PreTask ──▶ TransferTask ──▶ PostTask ──▶ AllDone
//!      │          │              │              │           ▲
//!      └──────────┴──────┬───────┴──────────────┘           │
//!                        ▼                                  │
//!                    ErrorTask ──── error tasks succeed ────┘
//! ```
//!
//! `global_last_step` remembers the last non-error stage so an interrupted
//! transfer restarts there: pre and post stages from their first task, the
//! data stage from its acknowledged rank.
//!
//! The runner only moves the record. Persisting it and choosing the next
//! stage after a failure is the worker's job.

use std::sync::Arc;

// ---

use chrono::Utc;

// ---

use r66_domain::{
    // ---
    is_legal_step,
    ErrorCode,
    GlobalStep,
    Rule,
    RunnerError,
    Stage,
    StepStatus,
    TaskError,
    TaskKind,
    TransferRecord,
    UpdatedInfo,
};

// ---

use super::context::EngineContext;
use super::file::TransferFile;
use super::task::{completion, TaskEffect, TaskEnv, TaskOutcome};

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskRunner {
    // ---
    record: TransferRecord,
    rule: Arc<Rule>,
}

impl TaskRunner {
    // ---
    pub fn new(record: TransferRecord, rule: Arc<Rule>) -> Self {
        Self { record, rule }
    }

    pub fn record(&self) -> &TransferRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut TransferRecord {
        &mut self.record
    }

    pub fn into_record(self) -> TransferRecord {
        self.record
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn move_to(&mut self, to: GlobalStep) -> Result<(), RunnerError> {
        // ---
        let from = self.record.global_step;
        if !is_legal_step(from, to) {
            return Err(RunnerError::IllegalTransition { from, to });
        }
        self.record.global_step = to;
        if to != GlobalStep::ErrorTask {
            self.record.global_last_step = to;
        }
        Ok(())
    }

    // ---

    /// Back to the start, ready to run.
    pub fn set_initial_task(&mut self) -> Result<(), RunnerError> {
        // ---
        self.move_to(GlobalStep::NoTask)?;
        self.record.step = 0;
        self.record.status = StepStatus::Running;
        Ok(())
    }

    pub fn set_pre_task(&mut self, step: u32) -> Result<(), RunnerError> {
        // ---
        self.move_to(GlobalStep::PreTask)?;
        self.record.step = step;
        self.record.status = StepStatus::Running;
        Ok(())
    }

    pub fn set_transfer_task(&mut self, rank: u32) -> Result<(), RunnerError> {
        // ---
        self.move_to(GlobalStep::TransferTask)?;
        self.record.step = 0;
        self.record.rank = rank;
        self.record.status = StepStatus::Running;
        Ok(())
    }

    /// Close the data stage. Returns the rank to persist.
    pub fn finish_transfer_task(&mut self, success: bool) -> u32 {
        // ---
        if success {
            self.record.status = StepStatus::Ok;
            self.record.info_status = ErrorCode::TransferOk;
        } else {
            self.record.status = StepStatus::Error;
        }
        self.record.rank
    }

    pub fn set_post_task(&mut self, step: u32) -> Result<(), RunnerError> {
        // ---
        self.move_to(GlobalStep::PostTask)?;
        self.record.step = step;
        self.record.status = StepStatus::Running;
        Ok(())
    }

    pub fn set_error_task(&mut self, step: u32) -> Result<(), RunnerError> {
        // ---
        self.move_to(GlobalStep::ErrorTask)?;
        self.record.step = step;
        self.record.status = StepStatus::Running;
        Ok(())
    }

    /// Terminal success. A transfer healed by its error tasks keeps its
    /// failure cause in `info_status` and `error_message`.
    pub fn set_all_done(&mut self) -> Result<(), RunnerError> {
        // ---
        self.move_to(GlobalStep::AllDone)?;
        self.record.step = 0;
        self.record.status = StepStatus::Ok;
        if self.record.info_status.is_ok() || self.record.info_status == ErrorCode::Unknown {
            self.record.info_status = ErrorCode::CompleteOk;
        }
        self.record.updated_info = UpdatedInfo::Done;
        self.record.stop = Some(Utc::now());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn is_all_done(&self) -> bool {
        self.record.global_step == GlobalStep::AllDone && self.record.status == StepStatus::Ok
    }

    pub fn is_in_error(&self) -> bool {
        self.record.global_step == GlobalStep::ErrorTask
            && self.record.status != StepStatus::Running
    }

    /// Finished either way: all done, or stuck in the error stage.
    pub fn is_finished(&self) -> bool {
        self.is_all_done() || self.is_in_error()
    }

    pub fn is_self_requested(&self, host_id: &str) -> bool {
        self.record.is_self_requested(host_id)
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Run the remaining tasks of the current stage, in order, one at a
    /// time. Stops at the first failing task.
    ///
    /// The runner must have been staged first (`status == Running`).
    pub async fn run(&mut self, ctx: &EngineContext) -> Result<(), RunnerError> {
        // ---
        if self.record.status != StepStatus::Running {
            return Err(RunnerError::InvalidState(self.record.status));
        }
        let global = self.record.global_step;
        let stage = Stage::of(global).ok_or(RunnerError::UnknownStep(global))?;
        let rule = self.rule.clone();
        let specs = rule.tasks(self.record.is_sender, stage);
        let paths = ctx.paths().for_rule(&rule);

        while let Some(spec) = specs.get(self.record.step as usize) {
            // ---
            let task = match ctx.tasks().build(spec) {
                Ok(t) => t,
                Err(cause) => return Err(self.fail_task(spec.kind, cause)),
            };

            let base = if self.record.is_sender {
                &paths.out_path
            } else {
                &paths.in_path
            };
            let file = TransferFile::resolve(&self.record.filename, base);
            let file_size = file.size().await.ok();
            let env = TaskEnv {
                record: self.record.clone(),
                file,
                local_host: ctx.host_id().to_string(),
                paths: paths.clone(),
                file_size,
            };

            tracing::debug!(
                key = %self.record.key(),
                stage = %global,
                step = self.record.step,
                kind = %spec.kind,
                "running task",
            );
            let (handle, done) = completion();
            task.run(&env, handle).await;

            match done.wait().await {
                TaskOutcome::Success(effect) => self.apply(effect),
                TaskOutcome::Warning(effect, message) => {
                    tracing::warn!(key = %self.record.key(), kind = %spec.kind, %message, "task warning");
                    self.apply(effect);
                }
                TaskOutcome::Failure(cause) => return Err(self.fail_task(spec.kind, cause)),
                TaskOutcome::Cancelled(reason) => {
                    self.record.mark_failed(ErrorCode::Canceled, reason.clone());
                    return Err(RunnerError::Cancelled {
                        kind: spec.kind,
                        reason,
                    });
                }
            }

            self.record.step += 1;
            if let Err(e) = ctx.save(&self.record).await {
                tracing::warn!(key = %self.record.key(), error = %e, "step not persisted");
            }
        }

        // End of stage.
        self.record.status = StepStatus::Ok;
        match stage {
            Stage::Pre => self.record.info_status = ErrorCode::PreProcessingOk,
            Stage::Post => self.record.info_status = ErrorCode::PostProcessingOk,
            Stage::Error => {}
        }
        Ok(())
    }

    fn apply(&mut self, effect: TaskEffect) {
        // ---
        if let Some(path) = effect.new_path {
            self.record.filename = path.display().to_string();
        }
        if effect.moved {
            self.record.is_file_moved = true;
        }
    }

    fn fail_task(&mut self, kind: TaskKind, cause: TaskError) -> RunnerError {
        // ---
        self.record.mark_failed(cause.code(), format!("{kind}: {cause}"));
        RunnerError::Task { kind, cause }
    }

    // -----------------------------------------------------------------------
    // Restart
    // -----------------------------------------------------------------------

    /// Put an unfinished transfer back at the start of its last stage.
    /// `false` if it already completed.
    pub fn reset(&mut self) -> bool {
        // ---
        if self.is_all_done() {
            return false;
        }
        let rec = &mut self.record;
        match rec.global_last_step {
            GlobalStep::PreTask => {
                rec.global_step = GlobalStep::PreTask;
                rec.step = 0;
                rec.info_status = ErrorCode::InitOk;
            }
            GlobalStep::TransferTask => {
                rec.global_step = GlobalStep::TransferTask;
                rec.step = 0;
                rec.info_status = ErrorCode::PreProcessingOk;
            }
            GlobalStep::PostTask => {
                rec.global_step = GlobalStep::PostTask;
                rec.step = 0;
                rec.info_status = ErrorCode::TransferOk;
            }
            GlobalStep::NoTask => {
                rec.global_step = GlobalStep::NoTask;
                rec.step = 0;
                rec.info_status = ErrorCode::Unknown;
            }
            GlobalStep::ErrorTask | GlobalStep::AllDone => {}
        }
        rec.status = StepStatus::Running;
        rec.error_message = None;
        rec.updated_info = UpdatedInfo::Unknown;
        true
    }

    // ---

    /// Make the transfer ready to run again.
    ///
    /// `submit` re-flags it `ToSubmit` for a later tick; otherwise it is
    /// flagged `Running` for immediate execution. A receiver resumed on
    /// the requested side steps back `rank_margin` blocks. Returns `false`
    /// if the transfer cannot restart here; an already finished one is
    /// then marked `QueryAlreadyFinished`.
    pub fn restart(&mut self, submit: bool, host_id: &str, rank_margin: u32) -> bool {
        // ---
        if submit
            && self.is_self_requested(host_id)
            && step_order(self.record.global_last_step) < step_order(GlobalStep::PostTask)
        {
            return false;
        }

        if !self.reset() {
            self.record.updated_info = UpdatedInfo::Done;
            self.record.info_status = ErrorCode::QueryAlreadyFinished;
            return false;
        }

        if !submit
            && self.record.global_step == GlobalStep::TransferTask
            && !self.record.is_sender
            && self.is_self_requested(host_id)
        {
            self.restart_rank(rank_margin);
        }
        self.record.updated_info = if submit {
            UpdatedInfo::ToSubmit
        } else {
            UpdatedInfo::Running
        };
        true
    }

    // ---

    /// Step a receiver back `margin` blocks, never below block 1 once
    /// something was received.
    pub fn restart_rank(&mut self, margin: u32) {
        // ---
        if self.record.is_sender || self.record.rank == 0 {
            return;
        }
        let old = self.record.rank;
        let new = old.saturating_sub(margin).max(1);
        if new != old {
            tracing::warn!(key = %self.record.key(), old, new, "receiver restarts at a lower rank");
        }
        self.record.rank = new;
    }

    // ---

    /// Stop or cancel an unfinished transfer. Cancel, stop and remote
    /// shutdown end it for good; any other cause leaves it resumable.
    /// `false` if it was already finished.
    pub fn stop_or_cancel(&mut self, code: ErrorCode) -> bool {
        // ---
        if self.is_finished() {
            return false;
        }
        self.reset();
        match code {
            ErrorCode::Canceled | ErrorCode::Stopped | ErrorCode::RemoteShutdown => {
                self.record.updated_info = UpdatedInfo::InError;
                self.record.mark_failed(code, format!("transfer {code}"));
            }
            _ => {
                self.record.updated_info = UpdatedInfo::Interrupted;
                self.record.info_status = code;
            }
        }
        tracing::warn!(key = %self.record.key(), %code, "transfer stopped");
        true
    }
}

// ---

fn step_order(step: GlobalStep) -> u8 {
    match step {
        GlobalStep::NoTask => 0,
        GlobalStep::PreTask => 1,
        GlobalStep::TransferTask => 2,
        GlobalStep::PostTask => 3,
        GlobalStep::ErrorTask => 4,
        GlobalStep::AllDone => 5,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::context_no_store;
    use r66_domain::{TaskSpec, TransferKey};

    fn record(is_sender: bool) -> TransferRecord {
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: 5,
        };
        TransferRecord::new("hosta", key, "r", is_sender, "f.bin")
    }

    fn log_to(path: &std::path::Path, text: &str) -> TaskSpec {
        TaskSpec::new(TaskKind::Log, format!("{text} {}", path.display()), 2)
    }

    #[tokio::test]
    async fn stage_runs_every_task_exactly_once() {
        // ---
        let (ctx, dir) = context_no_store("hosta");
        let trace = dir.path().join("trace.log");
        let mut rule = Rule::named("r");
        rule.send_pre = vec![log_to(&trace, "one"), log_to(&trace, "two"), log_to(&trace, "three")];

        let mut runner = TaskRunner::new(record(true), Arc::new(rule));
        runner.set_pre_task(0).unwrap();
        runner.run(&ctx).await.unwrap();

        let lines = tokio::fs::read_to_string(&trace).await.unwrap();
        assert_eq!(lines, "one\ntwo\nthree\n");
        assert_eq!(runner.record().status, StepStatus::Ok);
        assert_eq!(runner.record().step, 3, "step counts executed tasks");
        assert_eq!(runner.record().info_status, ErrorCode::PreProcessingOk);
    }

    #[tokio::test]
    async fn first_failure_stops_the_stage() {
        // ---
        let (ctx, dir) = context_no_store("hosta");
        let trace = dir.path().join("trace.log");
        let mut rule = Rule::named("r");
        rule.send_post = vec![
            log_to(&trace, "before"),
            TaskSpec::new(TaskKind::Delete, "", 0),
            log_to(&trace, "after"),
        ];

        let mut runner = TaskRunner::new(record(true), Arc::new(rule));
        runner.set_pre_task(0).unwrap();
        runner.set_transfer_task(0).unwrap();
        runner.set_post_task(0).unwrap();

        let err = runner.run(&ctx).await.unwrap_err();
        assert!(matches!(err, RunnerError::Task { kind: TaskKind::Delete, .. }));
        assert_eq!(runner.record().status, StepStatus::Error);
        assert_eq!(runner.record().step, 1, "failing task is not counted");
        assert!(runner.record().is_terminal_failure());

        let lines = tokio::fs::read_to_string(&trace).await.unwrap();
        assert_eq!(lines, "before\n", "tasks after the failure must not run");
    }

    #[tokio::test]
    async fn run_requires_a_staged_runner() {
        // ---
        let (ctx, _dir) = context_no_store("hosta");
        let mut runner = TaskRunner::new(record(true), Arc::new(Rule::named("r")));
        let err = runner.run(&ctx).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidState(StepStatus::Unknown)));

        runner.set_initial_task().unwrap();
        let err = runner.run(&ctx).await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownStep(GlobalStep::NoTask)));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        // ---
        let mut runner = TaskRunner::new(record(true), Arc::new(Rule::named("r")));
        let err = runner.set_post_task(0).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::IllegalTransition { from: GlobalStep::NoTask, to: GlobalStep::PostTask }
        ));
    }

    #[test]
    fn initial_task_restarts_from_any_step() {
        // ---
        let mut rec = record(true);
        rec.global_step = GlobalStep::ErrorTask;
        rec.global_last_step = GlobalStep::PostTask;
        rec.step = 3;
        let mut runner = TaskRunner::new(rec, Arc::new(Rule::named("r")));

        runner.set_initial_task().unwrap();
        let rec = runner.record();
        assert_eq!(rec.global_step, GlobalStep::NoTask);
        assert_eq!(rec.global_last_step, GlobalStep::NoTask, "history restarts too");
        assert_eq!(rec.step, 0);
        assert_eq!(rec.status, StepStatus::Running);
        runner.set_pre_task(0).unwrap();
    }

    #[test]
    fn error_stage_keeps_last_step_for_resume() {
        // ---
        let mut runner = TaskRunner::new(record(true), Arc::new(Rule::named("r")));
        runner.set_pre_task(0).unwrap();
        runner.set_transfer_task(7).unwrap();
        runner.set_error_task(0).unwrap();
        assert_eq!(runner.record().global_last_step, GlobalStep::TransferTask);

        runner.record_mut().status = StepStatus::Error;
        assert!(runner.is_finished(), "error stage no longer running is finished");
        runner.record_mut().status = StepStatus::Running;
        assert!(!runner.is_finished(), "error tasks still running");
    }

    #[test]
    fn reset_resumes_data_stage_at_rank() {
        // ---
        let mut rec = record(true);
        rec.global_step = GlobalStep::TransferTask;
        rec.global_last_step = GlobalStep::TransferTask;
        rec.rank = 7;
        rec.status = StepStatus::Error;
        rec.updated_info = UpdatedInfo::Interrupted;

        let mut runner = TaskRunner::new(rec, Arc::new(Rule::named("r")));
        assert!(runner.restart(false, "hosta", 30));
        assert_eq!(runner.record().global_step, GlobalStep::TransferTask);
        assert_eq!(runner.record().rank, 7, "requester side keeps its rank");
        assert_eq!(runner.record().updated_info, UpdatedInfo::Running);
    }

    #[test]
    fn requested_receiver_steps_back_but_not_below_one() {
        // ---
        let mut rec = record(false);
        rec.global_step = GlobalStep::TransferTask;
        rec.global_last_step = GlobalStep::TransferTask;
        rec.rank = 40;

        let mut runner = TaskRunner::new(rec.clone(), Arc::new(Rule::named("r")));
        assert!(runner.restart(false, "hostb", 30));
        assert_eq!(runner.record().rank, 10);

        rec.rank = 12;
        let mut runner = TaskRunner::new(rec, Arc::new(Rule::named("r")));
        assert!(runner.restart(false, "hostb", 30));
        assert_eq!(runner.record().rank, 1);
    }

    #[test]
    fn finished_transfer_is_not_restarted() {
        // ---
        let mut runner = TaskRunner::new(record(true), Arc::new(Rule::named("r")));
        runner.set_pre_task(0).unwrap();
        runner.set_transfer_task(0).unwrap();
        runner.set_post_task(0).unwrap();
        runner.set_all_done().unwrap();

        assert!(!runner.restart(true, "hosta", 30));
        assert_eq!(runner.record().info_status, ErrorCode::QueryAlreadyFinished);
        assert_eq!(runner.record().updated_info, UpdatedInfo::Done);
        assert!(!runner.stop_or_cancel(ErrorCode::Canceled));
    }

    #[test]
    fn stop_or_cancel_distinguishes_terminal_codes() {
        // ---
        let mut runner = TaskRunner::new(record(true), Arc::new(Rule::named("r")));
        runner.set_pre_task(0).unwrap();
        assert!(runner.stop_or_cancel(ErrorCode::Canceled));
        assert_eq!(runner.record().updated_info, UpdatedInfo::InError);
        assert!(runner.record().is_terminal_failure());

        let mut runner = TaskRunner::new(record(true), Arc::new(Rule::named("r")));
        runner.set_pre_task(0).unwrap();
        assert!(runner.stop_or_cancel(ErrorCode::ConnectionImpossible));
        assert_eq!(runner.record().updated_info, UpdatedInfo::Interrupted);
        assert!(!runner.record().is_terminal_failure(), "interrupted is only stalled");
    }
}
