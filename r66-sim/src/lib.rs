//! In-process fakes for R66 engine unit and integration testing.
//!
//! - [`MemoryStore`] implements [`r66_domain::PersistentStore`] over a
//!   `HashMap`, with injectable failures and a controllable monitor lock
//! - [`ScriptedTransport`] implements [`r66_domain::BlockTransport`] and
//!   plays a [`TransportScript`]: succeed, drop mid-transfer, or refuse
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use r66_sim::{MemoryStore, ScriptedTransport, TransportScript};
//!
//! let store = Arc::new(MemoryStore::default());
//! let transport = Arc::new(ScriptedTransport::new(TransportScript::drop_after(4)));
//! ```

mod config;
mod memory_store;
mod transport;

// --- public API
pub use config::TransportScript;
pub use memory_store::MemoryStore;
pub use transport::ScriptedTransport;
