//! Task runner, commanders and worker scheduler for the R66 transfer engine.
//!
//! Everything here is built from one [`EngineContext`]. The
//! [`InternalRunner`] ticks a [`Commander`] that finds transfers to run and
//! hands them to a bounded worker pool; each worker drives a [`TaskRunner`]
//! through its stages.
//!
//! # Structure
//!
//! - [`context`]   — [`EngineContext`], registries, live-key set
//! - [`runner`]    — [`TaskRunner`] state machine over a transfer record
//! - [`task`]      — pluggable rule tasks and the [`TaskRegistry`]
//! - [`worker`]    — one transfer from restart to a resting state
//! - [`commander`] — [`DbCommander`] and [`NoDbCommander`]
//! - [`scheduler`] — [`InternalRunner`] and its [`RunnerHandle`]
//! - [`archive`]   — JSON markers for the store-less mode
//! - [`file`]      — [`TransferFile`] path resolution and moves

mod archive;
mod commander;
mod context;
mod file;
mod runner;
mod scheduler;
mod task;
mod worker;

// --- context
pub use context::{
    // ---
    compose_transfer_id,
    ActiveGuard,
    ActiveTransfers,
    EngineContext,
    EngineSettings,
    HostRegistry,
    PathsConfig,
    RuleRegistry,
    StorePtr,
    TodoItem,
    TodoList,
};

// --- runner
pub use runner::TaskRunner;

// --- task
pub use task::{
    // ---
    completion,
    substitute,
    Completion,
    CompletionHandle,
    CopyTask,
    DeleteTask,
    ExecTask,
    LogTask,
    MoveTask,
    Task,
    TaskEffect,
    TaskEnv,
    TaskFactory,
    TaskOutcome,
    TaskRegistry,
    TestTask,
    ValidFilePathTask,
};

// --- worker
pub use worker::run_transfer;

// --- commander
pub use commander::{Commander, DbCommander, NoDbCommander};

// --- scheduler
pub use scheduler::{InternalRunner, RunnerHandle, SubmitOutcome};

// --- archive / file
pub use archive::ArchiveJournal;
pub use file::{TransferFile, TEMP_EXTENSION};

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    // ---
    use std::sync::Arc;

    use r66_domain::{BlockTransportPtr, TransferKey, TransferRecord};
    use r66_shaper::{GlobalChannelShaper, ShaperConfig};
    use r66_sim::{MemoryStore, ScriptedTransport, TransportScript};
    use tempfile::TempDir;

    use super::{EngineContext, EngineSettings, PathsConfig, StorePtr};

    /// Context rooted in a fresh temp dir. Keep the `TempDir` alive.
    pub(crate) fn context_from(
        host: &str,
        settings: EngineSettings,
        transport: Arc<ScriptedTransport>,
        store: Option<Arc<MemoryStore>>,
    ) -> (Arc<EngineContext>, TempDir) {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let shaper = GlobalChannelShaper::new(ShaperConfig::default());
        let transport: BlockTransportPtr = transport;
        let store = store.map(|s| s as StorePtr);
        let ctx = EngineContext::new(
            host,
            PathsConfig::under(dir.path()),
            settings,
            shaper,
            transport,
            store,
        );
        (ctx, dir)
    }

    pub(crate) fn context_with(
        host: &str,
        transport: Arc<ScriptedTransport>,
    ) -> (Arc<EngineContext>, Arc<MemoryStore>, TempDir) {
        // ---
        let store = Arc::new(MemoryStore::default());
        let (ctx, dir) =
            context_from(host, EngineSettings::default(), transport, Some(store.clone()));
        (ctx, store, dir)
    }

    pub(crate) fn context_with_store(host: &str) -> (Arc<EngineContext>, Arc<MemoryStore>, TempDir) {
        context_with(host, Arc::new(ScriptedTransport::new(TransportScript::succeed(1))))
    }

    pub(crate) fn context_no_store(host: &str) -> (Arc<EngineContext>, TempDir) {
        let transport = Arc::new(ScriptedTransport::new(TransportScript::succeed(1)));
        context_from(host, EngineSettings::default(), transport, None)
    }

    /// Sender `hosta -> hostb` on rule `default`.
    pub(crate) fn sender_record(id: i64) -> TransferRecord {
        // ---
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: id,
        };
        TransferRecord::new("hosta", key, "default", true, "f.bin")
    }
}
