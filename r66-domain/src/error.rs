use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---

use super::record::{GlobalStep, StepStatus};
use super::rule::TaskKind;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Stable cause code stored on a transfer record.
///
/// This is what an admin-facing status query shows next to `status`; it is
/// persisted, so variants are only ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorCode {
    // ---
    InitOk,
    PreProcessingOk,
    TransferOk,
    PostProcessingOk,
    CompleteOk,
    Running,
    #[default]
    Unknown,
    Warning,
    ExternalOp,
    CommandNotFound,
    FileNotFound,
    TransferError,
    ConnectionImpossible,
    NotAuthenticated,
    QueryRemotelyUnknown,
    LoopSelfRequestedHost,
    QueryAlreadyFinished,
    Canceled,
    Stopped,
    RemoteShutdown,
    Internal,
}

impl ErrorCode {
    // ---
    /// `true` for codes that describe a successful milestone.
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            Self::InitOk
                | Self::PreProcessingOk
                | Self::TransferOk
                | Self::PostProcessingOk
                | Self::CompleteOk
                | Self::Running
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failure modes of a [`crate::PersistentStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    // ---
    /// Store unreachable. Fatal for the current commander tick.
    #[error("store unreachable: {0}")]
    NoConnection(String),

    #[error("store query failed: {0}")]
    Sql(String),

    #[error("store data error: {0}")]
    Data(String),

    /// No row matched. Callers treat this as an empty result.
    #[error("no matching row")]
    NoData,
}

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TaskError {
    // ---
    #[error("unknown task kind: {0}")]
    UnknownKind(String),

    #[error("invalid task argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("command not executable: {0}")]
    NotExecutable(String),

    #[error("command exited with status {code}")]
    ExitStatus { code: i32 },

    #[error("command killed after {0} ms")]
    Timeout(u64),

    #[error("path not under any permitted base: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    // ---
    /// Cause code recorded on the transfer when this error ends a stage.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::NotExecutable(_) => ErrorCode::CommandNotFound,
            Self::UnknownKind(_) | Self::InvalidArgument(_) => ErrorCode::Internal,
            _ => ErrorCode::ExternalOp,
        }
    }
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Errors raised by the data stage of a transfer.
#[derive(Debug, Error)]
pub enum TransportError {
    // ---
    /// No connection, timeout or remote shutdown. Retried on a later tick.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Refused for a business reason (auth, unknown rule). Never retried.
    #[error("rejected ({code}): {reason}")]
    Business { code: ErrorCode, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// RunnerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunnerError {
    // ---
    #[error("current global step not ready to run (status {0})")]
    InvalidState(StepStatus),

    #[error("global step {0} has no task stage")]
    UnknownStep(GlobalStep),

    #[error("illegal step transition {from} -> {to}")]
    IllegalTransition { from: GlobalStep, to: GlobalStep },

    #[error("task {kind} failed: {cause}")]
    Task {
        kind: TaskKind,
        #[source]
        cause: TaskError,
    },

    #[error("task {kind} cancelled: {reason}")]
    Cancelled { kind: TaskKind, reason: String },
}

impl RunnerError {
    // ---
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Task { cause, .. } => cause.code(),
            Self::Cancelled { .. } => ErrorCode::Canceled,
            _ => ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// R66Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum R66Error {
    // ---
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no such rule: {0}")]
    NoSuchRule(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, R66Error>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn task_error_codes_distinguish_missing_command() {
        // ---
        assert_eq!(
            TaskError::NotExecutable("/bin/nope".into()).code(),
            ErrorCode::CommandNotFound
        );
        assert_eq!(
            TaskError::ExitStatus { code: 2 }.code(),
            ErrorCode::ExternalOp
        );
        assert!(!ErrorCode::ExternalOp.is_ok());
        assert!(ErrorCode::CompleteOk.is_ok());
    }
}
