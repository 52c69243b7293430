//! Pluggable rule tasks.
//!
//! A rule names tasks by [`TaskKind`]; the [`TaskRegistry`] maps each kind
//! to a factory built at startup. A task reports through a one-shot
//! [`CompletionHandle`]; the runner waits on the matching [`Completion`].
//!
//! ```text
//!  TaskSpec ──registry──▶ Box<dyn Task> ──run(env, handle)──▶ side effect
//!                                                     │
//!  runner ◀── Completion::wait() ◀── TaskOutcome ◀────┘
//! ```

mod exec;
mod fs;
mod log;
mod substitute;

use std::collections::HashMap;
use std::path::PathBuf;

// ---

use async_trait::async_trait;
use tokio::sync::oneshot;

// ---

use r66_domain::{TaskError, TaskKind, TaskSpec, TransferRecord};

// ---

use super::context::PathsConfig;
use super::file::TransferFile;

pub use exec::ExecTask;
pub use fs::{CopyTask, DeleteTask, MoveTask, ValidFilePathTask};
pub use log::{LogTask, TestTask};
pub use substitute::substitute;

// ---------------------------------------------------------------------------
// TaskEnv
// ---------------------------------------------------------------------------

/// What a task sees of the transfer it runs for.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    // ---
    pub record: TransferRecord,
    pub file: TransferFile,
    pub local_host: String,
    pub paths: PathsConfig,
    /// `None` when the file does not exist (yet).
    pub file_size: Option<u64>,
}

impl TaskEnv {
    // ---
    /// The peer of this transfer as seen from `local_host`.
    pub fn remote_host(&self) -> &str {
        if self.record.requester == self.local_host {
            &self.record.requested
        } else {
            &self.record.requester
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// File changes a task made, applied to the record by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskEffect {
    // ---
    /// The transfer's file now lives here.
    pub new_path: Option<PathBuf>,
    /// The file left its original location.
    pub moved: bool,
}

impl TaskEffect {
    pub fn moved_to(path: PathBuf) -> Self {
        Self {
            new_path: Some(path),
            moved: true,
        }
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Success(TaskEffect),
    /// Succeeded, but worth an operator's attention.
    Warning(TaskEffect, String),
    Failure(TaskError),
    Cancelled(String),
}

// ---

/// Producer half of a task's completion.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<TaskOutcome>,
}

impl CompletionHandle {
    // ---
    pub fn success(self, effect: TaskEffect) {
        let _ = self.tx.send(TaskOutcome::Success(effect));
    }

    pub fn warning(self, effect: TaskEffect, message: impl Into<String>) {
        let _ = self.tx.send(TaskOutcome::Warning(effect, message.into()));
    }

    pub fn fail(self, error: TaskError) {
        let _ = self.tx.send(TaskOutcome::Failure(error));
    }

    pub fn cancel(self, reason: impl Into<String>) {
        let _ = self.tx.send(TaskOutcome::Cancelled(reason.into()));
    }
}

/// Consumer half. A handle dropped without reporting reads as cancelled.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl Completion {
    // ---
    /// Non-blocking poll. `None` while the task is still running.
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(TaskOutcome::Cancelled("task dropped its completion".into()))
            }
        }
    }

    pub async fn wait(self) -> TaskOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| TaskOutcome::Cancelled("task dropped its completion".into()))
    }
}

pub fn completion() -> (CompletionHandle, Completion) {
    let (tx, rx) = oneshot::channel();
    (CompletionHandle { tx }, Completion { rx })
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Task: Send + Sync {
    // ---
    fn kind(&self) -> TaskKind;

    /// Perform the side effect and report through `done` exactly once.
    async fn run(&self, env: &TaskEnv, done: CompletionHandle);
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

pub type TaskFactory = fn(&TaskSpec) -> Box<dyn Task>;

pub struct TaskRegistry {
    factories: HashMap<TaskKind, TaskFactory>,
}

impl TaskRegistry {
    // ---
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    // ---

    /// Every built-in kind.
    pub fn with_defaults() -> Self {
        // ---
        let mut reg = Self::empty();
        reg.register(TaskKind::Log, |s| Box::new(LogTask::new(s)));
        reg.register(TaskKind::Test, |s| Box::new(TestTask::new(s)));
        reg.register(TaskKind::Move, |s| Box::new(MoveTask::new(s, false)));
        reg.register(TaskKind::MoveRename, |s| Box::new(MoveTask::new(s, true)));
        reg.register(TaskKind::Copy, |s| Box::new(CopyTask::new(s, false)));
        reg.register(TaskKind::CopyRename, |s| Box::new(CopyTask::new(s, true)));
        reg.register(TaskKind::Delete, |s| Box::new(DeleteTask::new(s)));
        reg.register(TaskKind::ValidFilePath, |s| Box::new(ValidFilePathTask::new(s)));
        reg.register(TaskKind::Exec, |s| Box::new(ExecTask::new(s, false)));
        reg.register(TaskKind::ExecRename, |s| Box::new(ExecTask::new(s, true)));
        reg
    }

    // ---

    pub fn register(&mut self, kind: TaskKind, factory: TaskFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn build(&self, spec: &TaskSpec) -> Result<Box<dyn Task>, TaskError> {
        // ---
        self.factories
            .get(&spec.kind)
            .map(|factory| factory(spec))
            .ok_or_else(|| TaskError::UnknownKind(spec.kind.name().to_string()))
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    // ---
    use super::*;
    use r66_domain::TransferKey;
    use std::path::Path;

    /// Environment for a sender `hosta -> hostb` working on `file`.
    pub(crate) fn env_for(file: &Path, home: &Path, info: &str) -> TaskEnv {
        // ---
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: 77,
        };
        let record = TransferRecord::new("hosta", key, "default", true, file.display().to_string())
            .with_file_info(info);
        TaskEnv {
            record,
            file: TransferFile::resolve(&file.display().to_string(), home),
            local_host: "hosta".into(),
            paths: PathsConfig::under(home),
            file_size: None,
        }
    }

    pub(crate) async fn run_task(task: &dyn Task, env: &TaskEnv) -> TaskOutcome {
        let (handle, done) = completion();
        task.run(env, handle).await;
        done.wait().await
    }

    #[test]
    fn every_kind_has_a_factory() {
        // ---
        let reg = TaskRegistry::with_defaults();
        for kind in TaskKind::ALL {
            let task = reg.build(&TaskSpec::new(kind, "", 0)).unwrap();
            assert_eq!(task.kind(), kind);
        }
    }

    #[test]
    fn empty_registry_rejects_kind() {
        let reg = TaskRegistry::empty();
        let err = reg.build(&TaskSpec::new(TaskKind::Exec, "", 0)).err();
        assert!(matches!(err, Some(TaskError::UnknownKind(k)) if k == "EXEC"));
    }

    #[test]
    fn dropped_handle_reads_as_cancelled() {
        // ---
        let (handle, mut done) = completion();
        assert!(done.try_outcome().is_none(), "nothing reported yet");
        drop(handle);
        assert!(matches!(done.try_outcome(), Some(TaskOutcome::Cancelled(_))));
    }

    #[test]
    fn remote_host_depends_on_side() {
        // ---
        let mut env = env_for(Path::new("/tmp/x"), Path::new("/tmp"), "");
        assert_eq!(env.remote_host(), "hostb");
        env.local_host = "hostb".into();
        assert_eq!(env.remote_host(), "hosta");
    }
}
