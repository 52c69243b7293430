//! `LOG` and `TEST` tasks.

use std::path::Path;

// ---

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

// ---

use r66_domain::{TaskKind, TaskSpec};

// ---

use super::{substitute, CompletionHandle, Task, TaskEffect, TaskEnv};

// ---------------------------------------------------------------------------
// LogTask
// ---------------------------------------------------------------------------

/// Writes its substituted argument somewhere.
///
/// The task's `timeout_ms` slot selects where: bit 0 to the warn log, bit 1
/// appended to the file named by the argument's last word. A file that
/// cannot be written falls back to the warn log; the task still succeeds.
pub struct LogTask {
    arg: String,
    mode: u64,
}

impl LogTask {
    pub fn new(spec: &TaskSpec) -> Self {
        Self {
            arg: spec.arg.clone(),
            mode: spec.timeout_ms,
        }
    }
}

#[async_trait]
impl Task for LogTask {
    // ---
    fn kind(&self) -> TaskKind {
        TaskKind::Log
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        // ---
        let text = substitute(&self.arg, env);
        let to_log = self.mode & 1 != 0;
        let to_file = self.mode & 2 != 0;

        let mut message = text.as_str();
        let mut target = None;
        if to_file {
            if let Some((head, last)) = text.trim_end().rsplit_once(char::is_whitespace) {
                message = head.trim_end();
                target = Some(last);
            }
        }

        if to_log {
            tracing::warn!(key = %env.record.key(), "{message}");
        }
        if let Some(path) = target {
            if let Err(e) = append_line(Path::new(path), message).await {
                tracing::warn!(file = path, error = %e, "{message}");
            }
        }
        done.success(TaskEffect::default());
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    // ---
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

// ---------------------------------------------------------------------------
// TestTask
// ---------------------------------------------------------------------------

/// Logs its argument and succeeds. Used to check rule wiring.
pub struct TestTask {
    arg: String,
}

impl TestTask {
    pub fn new(spec: &TaskSpec) -> Self {
        Self {
            arg: spec.arg.clone(),
        }
    }
}

#[async_trait]
impl Task for TestTask {
    // ---
    fn kind(&self) -> TaskKind {
        TaskKind::Test
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        tracing::info!(key = %env.record.key(), "test task: {}", substitute(&self.arg, env));
        done.success(TaskEffect::default());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::task::tests::{env_for, run_task};
    use crate::task::TaskOutcome;

    #[tokio::test]
    async fn file_mode_appends_message_to_last_word() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("audit.log");
        let arg = format!("received #TRUEFILENAME# from #REMOTEHOST# {}", log.display());
        let spec = TaskSpec::new(TaskKind::Log, arg, 2);
        let env = env_for(&dir.path().join("data.bin"), dir.path(), "");

        let task = LogTask::new(&spec);
        assert!(matches!(run_task(&task, &env).await, TaskOutcome::Success(_)));
        assert!(matches!(run_task(&task, &env).await, TaskOutcome::Success(_)));

        let content = tokio::fs::read_to_string(&log).await.unwrap();
        assert_eq!(content, "received data.bin from hostb\nreceived data.bin from hostb\n");
    }

    #[tokio::test]
    async fn unwritable_log_file_still_succeeds() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let arg = format!("msg {}", dir.path().join("no/such/dir/x.log").display());
        let spec = TaskSpec::new(TaskKind::Log, arg, 3);
        let env = env_for(&dir.path().join("f"), dir.path(), "");

        let outcome = run_task(&LogTask::new(&spec), &env).await;
        assert!(matches!(outcome, TaskOutcome::Success(_)));
    }
}
