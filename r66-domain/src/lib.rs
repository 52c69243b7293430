//! Core types, error taxonomy and store contract for the R66 transfer engine.
//!
//! This crate is the vocabulary of the system. Every other crate depends on
//! `r66-domain` and speaks its types. No runtime lives here.
//!
//! # Structure
//!
//! - [`error`]     — [`R66Error`], [`ErrorCode`] and the per-boundary errors
//! - [`record`]    — [`TransferRecord`] and its lifecycle enums
//! - [`step`]      — legal [`GlobalStep`] transitions
//! - [`rule`]      — [`Rule`], [`TaskSpec`], [`TaskKind`]
//! - [`store`]     — [`PersistentStore`] and its change rows
//! - [`transport`] — [`BlockTransport`] seam for the data stage

mod error;
mod record;
mod rule;
mod step;
mod store;
mod transport;

// --- error
pub use error::{
    // ---
    ErrorCode,
    R66Error,
    Result,
    RunnerError,
    StoreError,
    TaskError,
    TransportError,
};

// --- record
pub use record::{
    // ---
    GlobalStep,
    StepStatus,
    TransferKey,
    TransferRecord,
    UpdatedInfo,
    DEFAULT_BLOCK_SIZE,
};

// --- step
pub use step::{is_legal_step, step_successors};

// --- rule
pub use rule::{Rule, Stage, TaskKind, TaskSpec};

// --- store
pub use store::{
    // ---
    ConfigPayload,
    ConfigRow,
    EntityKind,
    HostConfig,
    HostEntry,
    LimitConfig,
    MonitorLock,
    PersistentStore,
    StoreResult,
    LIMIT_SUBMIT,
};

// --- transport
pub use transport::{BlockProgress, BlockTransport, BlockTransportPtr};
