//! `EXEC` and `EXECRENAME`: run an external command.
//!
//! Exit status contract:
//!
//! | status | outcome                                              |
//! |--------|------------------------------------------------------|
//! | 0      | success (`EXECRENAME` adopts the file it printed)    |
//! | 1      | success with a warning, file untouched               |
//! | other  | failure, file untouched                              |
//!
//! The child is spawned with `kill_on_drop`, so a timeout or an aborted
//! transfer kills it instead of leaving it running.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

// ---

use async_trait::async_trait;
use tokio::process::Command;

// ---

use r66_domain::{TaskError, TaskKind, TaskSpec};

// ---

use super::{substitute, CompletionHandle, Task, TaskEffect, TaskEnv};

// ---------------------------------------------------------------------------
// ExecTask
// ---------------------------------------------------------------------------

pub struct ExecTask {
    // ---
    arg: String,
    /// Zero waits forever.
    timeout_ms: u64,
    rename: bool,
}

impl ExecTask {
    pub fn new(spec: &TaskSpec, rename: bool) -> Self {
        Self {
            arg: spec.arg.clone(),
            timeout_ms: spec.timeout_ms,
            rename,
        }
    }

    // ---

    async fn execute(&self, env: &TaskEnv) -> Result<(i32, String), TaskError> {
        // ---
        let line = substitute(&self.arg, env);
        let mut words = line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| TaskError::InvalidArgument("empty command line".into()))?;
        check_executable(Path::new(program)).await?;

        let mut cmd = Command::new(program);
        cmd.args(words)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = if self.timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(self.timeout_ms), cmd.output())
                .await
                .map_err(|_| TaskError::Timeout(self.timeout_ms))?
        } else {
            cmd.output().await
        };
        let output = output.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                TaskError::NotExecutable(program.to_string())
            }
            _ => TaskError::Io(e),
        })?;

        // Killed by a signal: no code.
        let code = output.status.code().unwrap_or(-1);
        Ok((code, String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    // ---

    /// Adopt the file named by the command's last output line.
    async fn adopt_output(&self, env: &TaskEnv, stdout: &str) -> Result<TaskEffect, TaskError> {
        // ---
        let Some(name) = last_output_token(stdout) else {
            tracing::warn!(command = %self.arg, "rename command printed no file name");
            return Ok(TaskEffect::default());
        };
        let new_path = PathBuf::from(name);
        if !tokio::fs::try_exists(&new_path).await.unwrap_or(false) {
            return Err(TaskError::FileNotFound(new_path));
        }
        if new_path != env.file.path() && env.file.exists().await {
            if let Err(e) = env.file.delete().await {
                tracing::warn!(file = %env.file.display(), error = %e, "old file not removed");
            }
        }
        Ok(TaskEffect::moved_to(new_path))
    }
}

#[async_trait]
impl Task for ExecTask {
    // ---
    fn kind(&self) -> TaskKind {
        if self.rename {
            TaskKind::ExecRename
        } else {
            TaskKind::Exec
        }
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        // ---
        let (code, stdout) = match self.execute(env).await {
            Ok(r) => r,
            Err(e) => return done.fail(e),
        };

        match code {
            0 if self.rename => match self.adopt_output(env, &stdout).await {
                Ok(effect) => done.success(effect),
                Err(e) => done.fail(e),
            },
            0 => done.success(TaskEffect::default()),
            1 => {
                tracing::warn!(command = %self.arg, "command exited with warning status 1");
                done.warning(TaskEffect::default(), "exit status 1");
            }
            code => {
                tracing::error!(command = %self.arg, code, "command failed");
                done.fail(TaskError::ExitStatus { code });
            }
        }
    }
}

// ---

/// Last whitespace-separated token of the last non-blank line.
fn last_output_token(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().last())
}

// ---

/// Paths must exist and carry an execute bit; bare names are left to the
/// `PATH` lookup at spawn time.
async fn check_executable(program: &Path) -> Result<(), TaskError> {
    // ---
    if program.components().count() <= 1 {
        return Ok(());
    }
    let not_exec = || TaskError::NotExecutable(program.display().to_string());
    let meta = tokio::fs::metadata(program).await.map_err(|_| not_exec())?;
    if !meta.is_file() {
        return Err(not_exec());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(not_exec());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    // ---
    use super::*;
    use crate::task::tests::{env_for, run_task};
    use crate::task::TaskOutcome;

    fn exec(arg: &str, timeout_ms: u64) -> ExecTask {
        ExecTask::new(&TaskSpec::new(TaskKind::Exec, arg, timeout_ms), false)
    }

    async fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        // ---
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n")).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    #[tokio::test]
    async fn exit_codes_map_to_success_warning_failure() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let env = env_for(&dir.path().join("f"), dir.path(), "");

        let ok = script(dir.path(), "ok.sh", "exit 0").await;
        let warn = script(dir.path(), "warn.sh", "exit 1").await;
        let fail = script(dir.path(), "fail.sh", "exit 2").await;

        assert!(matches!(
            run_task(&exec(&ok.display().to_string(), 0), &env).await,
            TaskOutcome::Success(_)
        ));
        assert!(matches!(
            run_task(&exec(&warn.display().to_string(), 0), &env).await,
            TaskOutcome::Warning(..)
        ));
        assert!(matches!(
            run_task(&exec(&fail.display().to_string(), 0), &env).await,
            TaskOutcome::Failure(TaskError::ExitStatus { code: 2 })
        ));
    }

    #[tokio::test]
    async fn rename_adopts_last_printed_path() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("in.dat");
        let new = dir.path().join("out.dat");
        tokio::fs::write(&old, b"payload").await.unwrap();

        let body = "mv \"$1\" \"$2\"\necho moving\necho done \"$2\"\necho";
        let cmd = script(dir.path(), "mv.sh", body).await;
        let arg = format!("{} #TRUEFULLPATH# {}", cmd.display(), new.display());
        let task = ExecTask::new(&TaskSpec::new(TaskKind::ExecRename, arg, 0), true);

        let env = env_for(&old, dir.path(), "");
        match run_task(&task, &env).await {
            TaskOutcome::Success(effect) => assert_eq!(effect.new_path, Some(new.clone())),
            other => panic!("expected success, got {other:?}"),
        }
        assert!(!old.exists());
    }

    #[tokio::test]
    async fn non_executable_path_is_command_not_found() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.txt");
        tokio::fs::write(&plain, b"echo hi").await.unwrap();
        let env = env_for(&dir.path().join("f"), dir.path(), "");

        let outcome = run_task(&exec(&plain.display().to_string(), 0), &env).await;
        match outcome {
            TaskOutcome::Failure(e) => assert_eq!(e.code(), r66_domain::ErrorCode::CommandNotFound),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let slow = script(dir.path(), "slow.sh", "sleep 5").await;
        let env = env_for(&dir.path().join("f"), dir.path(), "");

        let started = std::time::Instant::now();
        let outcome = run_task(&exec(&slow.display().to_string(), 100), &env).await;
        assert!(matches!(outcome, TaskOutcome::Failure(TaskError::Timeout(100))));
        assert!(started.elapsed() < Duration::from_secs(4), "must not wait for the child");
    }

    #[test]
    fn last_token_skips_trailing_blank_lines() {
        assert_eq!(last_output_token("a\nmoved to /x/y \n\n  \n"), Some("/x/y"));
        assert_eq!(last_output_token("\n\n"), None);
    }
}
