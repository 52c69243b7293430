//! Filesystem tasks: move, copy, delete and path validation.

use std::path::PathBuf;

// ---

use async_trait::async_trait;

// ---

use r66_domain::{TaskError, TaskKind, TaskSpec};

// ---

use super::{substitute, CompletionHandle, Task, TaskEffect, TaskEnv};
use crate::file::TransferFile;

/// Target path for a move or copy. Without `rename` the argument is a
/// directory and the file keeps its true name.
fn target_path(arg: &str, rename: bool, env: &TaskEnv) -> Result<PathBuf, TaskError> {
    // ---
    let resolved = substitute(arg, env);
    let resolved = resolved.trim();
    if resolved.is_empty() {
        return Err(TaskError::InvalidArgument("empty target path".into()));
    }
    let base = PathBuf::from(resolved);
    Ok(if rename {
        base
    } else {
        base.join(env.file.true_file_name())
    })
}

async fn require_file(file: &TransferFile) -> Result<(), TaskError> {
    if file.exists().await {
        Ok(())
    } else {
        Err(TaskError::FileNotFound(file.path().to_path_buf()))
    }
}

// ---------------------------------------------------------------------------
// MoveTask
// ---------------------------------------------------------------------------

/// `MOVE` (into a directory) and `MOVERENAME` (to a full path).
pub struct MoveTask {
    arg: String,
    rename: bool,
}

impl MoveTask {
    pub fn new(spec: &TaskSpec, rename: bool) -> Self {
        Self {
            arg: spec.arg.clone(),
            rename,
        }
    }
}

#[async_trait]
impl Task for MoveTask {
    // ---
    fn kind(&self) -> TaskKind {
        if self.rename {
            TaskKind::MoveRename
        } else {
            TaskKind::Move
        }
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        // ---
        let result = async {
            let target = target_path(&self.arg, self.rename, env)?;
            require_file(&env.file).await?;
            let moved = env.file.rename_to(&target).await?;
            Ok::<_, TaskError>(moved)
        }
        .await;

        match result {
            Ok(moved) => {
                tracing::debug!(to = %moved.display(), "file moved");
                done.success(TaskEffect::moved_to(moved.path().to_path_buf()));
            }
            Err(e) => done.fail(e),
        }
    }
}

// ---------------------------------------------------------------------------
// CopyTask
// ---------------------------------------------------------------------------

/// `COPY` and `COPYRENAME`. The transfer keeps working on the original.
pub struct CopyTask {
    arg: String,
    rename: bool,
}

impl CopyTask {
    pub fn new(spec: &TaskSpec, rename: bool) -> Self {
        Self {
            arg: spec.arg.clone(),
            rename,
        }
    }
}

#[async_trait]
impl Task for CopyTask {
    // ---
    fn kind(&self) -> TaskKind {
        if self.rename {
            TaskKind::CopyRename
        } else {
            TaskKind::Copy
        }
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        // ---
        let result = async {
            let target = target_path(&self.arg, self.rename, env)?;
            require_file(&env.file).await?;
            Ok::<_, TaskError>(env.file.copy_to(&target).await?)
        }
        .await;

        match result {
            Ok(copy) => {
                tracing::debug!(to = %copy.display(), "file copied");
                done.success(TaskEffect::default());
            }
            Err(e) => done.fail(e),
        }
    }
}

// ---------------------------------------------------------------------------
// DeleteTask
// ---------------------------------------------------------------------------

pub struct DeleteTask;

impl DeleteTask {
    pub fn new(_spec: &TaskSpec) -> Self {
        Self
    }
}

#[async_trait]
impl Task for DeleteTask {
    // ---
    fn kind(&self) -> TaskKind {
        TaskKind::Delete
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        // ---
        match env.file.delete().await {
            Ok(()) => done.success(TaskEffect::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                done.fail(TaskError::FileNotFound(env.file.path().to_path_buf()))
            }
            Err(e) => done.fail(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidFilePathTask
// ---------------------------------------------------------------------------

/// Succeeds if the file lives under one of the space-separated bases.
pub struct ValidFilePathTask {
    arg: String,
}

impl ValidFilePathTask {
    pub fn new(spec: &TaskSpec) -> Self {
        Self {
            arg: spec.arg.clone(),
        }
    }
}

#[async_trait]
impl Task for ValidFilePathTask {
    // ---
    fn kind(&self) -> TaskKind {
        TaskKind::ValidFilePath
    }

    async fn run(&self, env: &TaskEnv, done: CompletionHandle) {
        // ---
        let bases = substitute(&self.arg, env);
        let path = env.file.path();
        if bases.split_whitespace().any(|base| path.starts_with(base)) {
            done.success(TaskEffect::default());
        } else {
            done.fail(TaskError::InvalidPath(path.display().to_string()));
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
    use crate::task::tests::{env_for, run_task};
    use crate::task::TaskOutcome;

    #[tokio::test]
    async fn move_into_directory_keeps_true_name() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("report.csv.part");
        tokio::fs::write(&src, b"1,2,3").await.unwrap();

        let archive = dir.path().join("archive");
        let spec = TaskSpec::new(TaskKind::Move, archive.display().to_string(), 0);
        let env = env_for(&src, dir.path(), "");

        match run_task(&MoveTask::new(&spec, false), &env).await {
            TaskOutcome::Success(effect) => {
                assert_eq!(effect.new_path, Some(archive.join("report.csv")));
                assert!(effect.moved);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn copy_rename_leaves_source_in_place() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        tokio::fs::write(&src, b"x").await.unwrap();

        let spec = TaskSpec::new(TaskKind::CopyRename, "#HOMEPATH#/backup/%s.bak", 0);
        let env = env_for(&src, dir.path(), "a");

        let outcome = run_task(&CopyTask::new(&spec, true), &env).await;
        assert!(matches!(outcome, TaskOutcome::Success(ref e) if e.new_path.is_none()));
        assert!(src.exists(), "copy must not remove the source");
        assert!(dir.path().join("backup/a.bak").exists());
    }

    #[tokio::test]
    async fn move_of_missing_file_fails() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let spec = TaskSpec::new(TaskKind::Move, dir.path().display().to_string(), 0);
        let env = env_for(&dir.path().join("ghost"), dir.path(), "");

        let outcome = run_task(&MoveTask::new(&spec, false), &env).await;
        assert!(matches!(outcome, TaskOutcome::Failure(TaskError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn valid_file_path_checks_prefixes() {
        // ---
        let spec = TaskSpec::new(TaskKind::ValidFilePath, "/srv/in /srv/out", 0);
        let task = ValidFilePathTask::new(&spec);

        let ok = env_for(std::path::Path::new("/srv/out/f"), std::path::Path::new("/srv"), "");
        assert!(matches!(run_task(&task, &ok).await, TaskOutcome::Success(_)));

        let bad = env_for(std::path::Path::new("/etc/passwd"), std::path::Path::new("/srv"), "");
        assert!(matches!(
            run_task(&task, &bad).await,
            TaskOutcome::Failure(TaskError::InvalidPath(_))
        ));
    }
}
