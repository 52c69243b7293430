//! [`PersistentStore`] contract and the change rows it carries.
//!
//! The store itself (SQL dialect, connection pool) lives outside this
//! workspace. Everything above it speaks these types only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

use super::error::StoreError;
use super::record::{TransferKey, TransferRecord, UpdatedInfo};
use super::rule::Rule;

/// Upper bound on `ToSubmit` records fetched per commander tick.
pub const LIMIT_SUBMIT: usize = 100;

// ---

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Change rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Configuration,
    HostConfiguration,
    HostAuth,
    Rule,
}

/// Bandwidth configuration of a host. Limits in bytes/s, `<= 0` unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    // ---
    pub host_id: String,
    pub read_global_limit: i64,
    pub write_global_limit: i64,
    pub read_channel_limit: i64,
    pub write_channel_limit: i64,
    pub check_interval_ms: u64,
}

/// Business and alias settings for a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub host_id: String,
    pub business: Vec<String>,
    pub aliases: Vec<String>,
}

/// A remote host this node may talk to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    pub is_ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigPayload {
    Limits(LimitConfig),
    HostConfig(HostConfig),
    Host(HostEntry),
    Rule(Rule),
}

impl ConfigPayload {
    // ---
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Limits(_) => EntityKind::Configuration,
            Self::HostConfig(_) => EntityKind::HostConfiguration,
            Self::Host(_) => EntityKind::HostAuth,
            Self::Rule(_) => EntityKind::Rule,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Limits(l) => &l.host_id,
            Self::HostConfig(h) => &h.host_id,
            Self::Host(h) => &h.host_id,
            Self::Rule(r) => &r.name,
        }
    }
}

/// A configuration, host or rule row with its change flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub updated_info: UpdatedInfo,
    pub payload: ConfigPayload,
}

impl ConfigRow {
    pub fn updated(payload: ConfigPayload) -> Self {
        Self {
            updated_info: UpdatedInfo::ToSubmit,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorLock
// ---------------------------------------------------------------------------

/// Cross-instance advisory lock row, held for the length of one commander
/// tick in multi-instance deployments.
///
/// Each counter tracks how many instances have applied the pending change of
/// that entity kind; the change flag may only be cleared by the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorLock {
    // ---
    pub holder: Uuid,
    pub instances: u32,
    pub config_seen: u32,
    pub host_seen: u32,
    pub rule_seen: u32,
}

impl MonitorLock {
    // ---
    pub fn new(holder: Uuid, instances: u32) -> Self {
        Self {
            holder,
            instances: instances.max(1),
            config_seen: 0,
            host_seen: 0,
            rule_seen: 0,
        }
    }

    /// Record one more instance having applied configuration changes.
    /// `true` once every instance has, meaning the flag may be cleared.
    pub fn check_update_config(&mut self) -> bool {
        Self::check(&mut self.config_seen, self.instances)
    }

    pub fn check_update_host(&mut self) -> bool {
        Self::check(&mut self.host_seen, self.instances)
    }

    pub fn check_update_rule(&mut self) -> bool {
        Self::check(&mut self.rule_seen, self.instances)
    }

    fn check(seen: &mut u32, instances: u32) -> bool {
        *seen += 1;
        if *seen >= instances {
            *seen = 0;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// PersistentStore
// ---------------------------------------------------------------------------

/// Row store for transfer records, configuration rows and the id sequence.
///
/// `NoData` from a query method is never returned; an empty `Vec` is.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    // ---
    /// Rows of `kind` whose change flag is set.
    async fn query_updated(&self, kind: EntityKind) -> StoreResult<Vec<ConfigRow>>;

    /// Persist a configuration row (typically to clear its flag).
    async fn update_config(&self, row: &ConfigRow) -> StoreResult<()>;

    /// Up to `limit` transfers tagged `flag`, ordered by start time then id.
    async fn query_by_flag(
        &self,
        flag: UpdatedInfo,
        limit: usize,
    ) -> StoreResult<Vec<TransferRecord>>;

    async fn load_transfer(&self, key: &TransferKey) -> StoreResult<TransferRecord>;

    async fn insert_transfer(&self, record: &TransferRecord) -> StoreResult<()>;

    /// `NoData` if the record no longer exists.
    async fn update_transfer(&self, record: &TransferRecord) -> StoreResult<()>;

    async fn next_sequence_value(&self) -> StoreResult<i64>;

    async fn reset_sequence(&self, value: i64) -> StoreResult<()>;

    /// Startup recovery: `Running`/`Interrupted` become `ToSubmit`.
    /// Returns the number of records changed.
    async fn reset_to_submit(&self) -> StoreResult<u64>;

    /// Startup cleanup: finished transfers still tagged otherwise become
    /// `Done`. Returns the number of records changed.
    async fn change_finished_to_done(&self) -> StoreResult<u64>;

    /// `Ok(None)` when another instance holds the lock.
    async fn try_lock_monitor(&self, holder: Uuid, instances: u32)
        -> StoreResult<Option<MonitorLock>>;

    /// Persist the counters and release the lock.
    async fn release_monitor(&self, lock: MonitorLock) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn monitor_clears_only_after_every_instance() {
        // ---
        let mut lock = MonitorLock::new(Uuid::new_v4(), 3);
        assert!(!lock.check_update_rule());
        assert!(!lock.check_update_rule());
        assert!(lock.check_update_rule(), "third instance clears the flag");
        assert_eq!(lock.rule_seen, 0, "counter restarts for the next change");
        assert!(!lock.check_update_config(), "kinds count independently");
    }

    #[test]
    fn single_instance_always_clears() {
        let mut lock = MonitorLock::new(Uuid::new_v4(), 0);
        assert!(lock.check_update_host());
    }
}
