//! [`EngineContext`] — the one handle every engine component is built from.
//!
//! Constructed once at process start and passed by `Arc` into the commander,
//! the scheduler and every worker. Nothing in the engine reads global state.
//!
//! ```text
//!                 ┌──────────────── EngineContext ────────────────┐
//!  commander ───▶ │ rules  hosts  tasks  settings  paths          │
//!  scheduler ───▶ │ active (live keys)   todo (no-store FIFO)     │
//!  workers   ───▶ │ store? ── journal    shaper    transport      │
//!                 └───────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

// ---

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::AbortHandle;
use uuid::Uuid;

// ---

use r66_domain::{
    // ---
    BlockTransportPtr,
    ConfigPayload,
    ConfigRow,
    HostConfig,
    HostEntry,
    PersistentStore,
    R66Error,
    Result,
    Rule,
    StoreError,
    TransferKey,
    TransferRecord,
    UpdatedInfo,
};
use r66_shaper::GlobalChannelShaper;

// ---

use super::archive::ArchiveJournal;
use super::task::TaskRegistry;

pub type StorePtr = Arc<dyn PersistentStore>;

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

/// Scheduling knobs. Defaults match a single-node deployment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    // ---
    /// Delay between two commander ticks.
    pub commander_delay_ms: u64,

    /// Worker pool size.
    pub max_workers: usize,

    /// Headroom kept free for control-plane work: a submission is requeued
    /// once `active + reserved_workers > max_workers`.
    pub reserved_workers: usize,

    /// Pause between two submissions of the no-store commander.
    pub submit_spacing_ms: u64,

    /// Blocks a restarted receiver steps back from its last rank.
    pub rank_restart: u32,

    /// Instances sharing the store. Above 1 the commander takes the
    /// monitor lock each tick.
    pub monitor_instances: u32,

    /// High 32 bits of locally generated transfer ids.
    pub id_prefix: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        // ---
        Self {
            commander_delay_ms: 5_000,
            max_workers: 20,
            reserved_workers: 5,
            submit_spacing_ms: 100,
            rank_restart: 30,
            monitor_instances: 1,
            id_prefix: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// PathsConfig
// ---------------------------------------------------------------------------

/// Host directories. Rules may override each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    // ---
    pub home: PathBuf,
    pub in_path: PathBuf,
    pub out_path: PathBuf,
    pub work_path: PathBuf,
    pub arch_path: PathBuf,
}

impl PathsConfig {
    // ---
    /// Standard layout: `in`, `out`, `work` and `arch` under `home`.
    pub fn under(home: impl Into<PathBuf>) -> Self {
        // ---
        let home = home.into();
        Self {
            in_path: home.join("in"),
            out_path: home.join("out"),
            work_path: home.join("work"),
            arch_path: home.join("arch"),
            home,
        }
    }

    // ---

    /// Directories as seen by a transfer running under `rule`.
    pub fn for_rule(&self, rule: &Rule) -> PathsConfig {
        // ---
        let pick = |over: &Option<String>, default: &Path| match over {
            Some(p) if !p.trim().is_empty() => self.home.join(p.trim()),
            _ => default.to_path_buf(),
        };
        PathsConfig {
            home: self.home.clone(),
            in_path: pick(&rule.recv_path, &self.in_path),
            out_path: pick(&rule.send_path, &self.out_path),
            work_path: pick(&rule.work_path, &self.work_path),
            arch_path: pick(&rule.arch_path, &self.arch_path),
        }
    }
}

// ---------------------------------------------------------------------------
// RuleRegistry / HostRegistry
// ---------------------------------------------------------------------------

/// Rules by name. A changed rule replaces the `Arc`; running transfers
/// keep the version they started with.
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
}

impl RuleRegistry {
    // ---
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    pub fn insert(&self, rule: Rule) {
        self.rules.write().insert(rule.name.clone(), Arc::new(rule));
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

// ---

#[derive(Default)]
pub struct HostRegistry {
    // ---
    hosts: RwLock<HashMap<String, HostEntry>>,
    configs: RwLock<HashMap<String, HostConfig>>,
}

impl HostRegistry {
    // ---
    pub fn host(&self, id: &str) -> Option<HostEntry> {
        self.hosts.read().get(id).cloned()
    }

    pub fn host_config(&self, id: &str) -> Option<HostConfig> {
        self.configs.read().get(id).cloned()
    }

    pub fn upsert_host(&self, host: HostEntry) {
        self.hosts.write().insert(host.host_id.clone(), host);
    }

    pub fn upsert_config(&self, config: HostConfig) {
        self.configs.write().insert(config.host_id.clone(), config);
    }
}

// ---------------------------------------------------------------------------
// ActiveTransfers
// ---------------------------------------------------------------------------

/// Keys of transfers currently owned by a worker.
///
/// A key is claimed before the worker is spawned and released when the
/// worker's [`ActiveGuard`] drops, whether it finished or was aborted.
#[derive(Default)]
pub struct ActiveTransfers {
    map: DashMap<TransferKey, Option<AbortHandle>>,
}

impl ActiveTransfers {
    // ---
    /// `false` if the key is already live.
    pub fn try_claim(&self, key: TransferKey) -> bool {
        // ---
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(None);
                true
            }
        }
    }

    // ---

    /// Attach the worker's abort handle. Ignored if the worker already
    /// finished and released its key.
    pub fn set_handle(&self, key: &TransferKey, handle: AbortHandle) {
        if let Some(mut entry) = self.map.get_mut(key) {
            *entry = Some(handle);
        }
    }

    // ---

    pub fn release(&self, key: &TransferKey) {
        self.map.remove(key);
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    // ---

    /// Abort one worker. `true` if the key was live.
    pub fn abort(&self, key: &TransferKey) -> bool {
        // ---
        let handle = self.map.get(key).map(|e| e.value().clone());
        match handle {
            Some(Some(h)) => {
                h.abort();
                true
            }
            Some(None) => true,
            None => false,
        }
    }

    // ---

    pub fn abort_all(&self) -> usize {
        // ---
        let handles: Vec<AbortHandle> = self
            .map
            .iter()
            .filter_map(|e| e.value().clone())
            .collect();
        for h in &handles {
            h.abort();
        }
        handles.len()
    }
}

// ---

/// Releases its key from [`ActiveTransfers`] on drop.
pub struct ActiveGuard {
    // ---
    active: Arc<ActiveTransfers>,
    key: TransferKey,
}

impl ActiveGuard {
    pub fn new(active: Arc<ActiveTransfers>, key: TransferKey) -> Self {
        Self { active, key }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.release(&self.key);
    }
}

// ---------------------------------------------------------------------------
// TodoList
// ---------------------------------------------------------------------------

/// Work for the no-store commander.
#[derive(Debug, Clone)]
pub enum TodoItem {
    Config(ConfigRow),
    Transfer(TransferRecord),
}

/// FIFO replacing the store's `ToSubmit` query when running without one.
#[derive(Default)]
pub struct TodoList {
    queue: Mutex<VecDeque<TodoItem>>,
}

impl TodoList {
    // ---
    pub fn push(&self, item: TodoItem) {
        self.queue.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<TodoItem> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

pub struct EngineContext {
    // ---
    host_id: String,
    instance: Uuid,

    paths: PathsConfig,
    settings: EngineSettings,

    shaper: Arc<GlobalChannelShaper>,
    transport: BlockTransportPtr,

    /// `None` runs the engine store-less: records live in `journal`.
    store: Option<StorePtr>,
    journal: ArchiveJournal,

    rules: RuleRegistry,
    hosts: HostRegistry,
    tasks: TaskRegistry,

    active: Arc<ActiveTransfers>,
    todo: TodoList,

    /// Local id sequence for the store-less mode.
    local_sequence: AtomicI64,
    shutting_down: AtomicBool,
}

impl EngineContext {
    // ---
    pub fn new(
        host_id: impl Into<String>,
        paths: PathsConfig,
        settings: EngineSettings,
        shaper: Arc<GlobalChannelShaper>,
        transport: BlockTransportPtr,
        store: Option<StorePtr>,
    ) -> Arc<Self> {
        // ---
        let journal = ArchiveJournal::new(paths.arch_path.clone());
        // Seeded from the clock so ids stay unique across restarts.
        let seed = Utc::now().timestamp_millis() & 0xffff_ffff;

        Arc::new(Self {
            host_id: host_id.into(),
            instance: Uuid::new_v4(),
            paths,
            settings,
            shaper,
            transport,
            store,
            journal,
            rules: RuleRegistry::default(),
            hosts: HostRegistry::default(),
            tasks: TaskRegistry::with_defaults(),
            active: Arc::new(ActiveTransfers::default()),
            todo: TodoList::default(),
            local_sequence: AtomicI64::new(seed),
            shutting_down: AtomicBool::new(false),
        })
    }

    // ---

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn shaper(&self) -> &Arc<GlobalChannelShaper> {
        &self.shaper
    }

    pub fn transport(&self) -> &BlockTransportPtr {
        &self.transport
    }

    pub fn store(&self) -> Option<&StorePtr> {
        self.store.as_ref()
    }

    pub fn journal(&self) -> &ArchiveJournal {
        &self.journal
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn active(&self) -> &Arc<ActiveTransfers> {
        &self.active
    }

    pub fn todo(&self) -> &TodoList {
        &self.todo
    }

    // ---

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    // ---

    /// Persist `record`: store row (inserted if missing) or archive marker.
    pub async fn save(&self, record: &TransferRecord) -> Result<()> {
        // ---
        match &self.store {
            Some(store) => match store.update_transfer(record).await {
                Err(StoreError::NoData) => Ok(store.insert_transfer(record).await?),
                other => Ok(other?),
            },
            None => Ok(self.journal.write(record).await?),
        }
    }

    // ---

    pub async fn load(&self, key: &TransferKey) -> Result<TransferRecord> {
        // ---
        match &self.store {
            Some(store) => Ok(store.load_transfer(key).await?),
            None => self
                .journal
                .load(key)
                .await?
                .ok_or(R66Error::Store(StoreError::NoData)),
        }
    }

    // ---

    /// Flag `record` for a later tick and persist it. Without a store the
    /// record also goes back on the FIFO.
    pub async fn requeue(&self, mut record: TransferRecord) -> Result<()> {
        // ---
        record.updated_info = UpdatedInfo::ToSubmit;
        self.save(&record).await?;
        if self.store.is_none() {
            self.todo.push(TodoItem::Transfer(record));
        }
        Ok(())
    }

    // ---

    /// Register a new transfer request. It runs on a later commander tick.
    pub async fn submit_request(&self, record: TransferRecord) -> Result<()> {
        // ---
        tracing::info!(key = %record.key(), rule = %record.rule_name, "transfer requested");
        self.requeue(record).await
    }

    // ---

    /// Next transfer id: `(id_prefix << 32) | (sequence & 0xffff_ffff)`.
    pub async fn new_transfer_id(&self) -> Result<i64> {
        // ---
        let seq = match &self.store {
            Some(store) => store.next_sequence_value().await?,
            None => self.local_sequence.fetch_add(1, Ordering::AcqRel),
        };
        Ok(compose_transfer_id(self.settings.id_prefix, seq))
    }

    // ---

    /// Apply one changed configuration, host or rule row locally.
    pub fn apply_config(&self, payload: &ConfigPayload) {
        // ---
        match payload {
            ConfigPayload::Limits(limits) if limits.host_id == self.host_id => {
                tracing::info!(
                    write_global = limits.write_global_limit,
                    read_global = limits.read_global_limit,
                    write_channel = limits.write_channel_limit,
                    read_channel = limits.read_channel_limit,
                    "bandwidth limits updated",
                );
                self.shaper.configure(
                    limits.write_global_limit,
                    limits.read_global_limit,
                    limits.check_interval_ms,
                );
                self.shaper
                    .configure_channel(limits.write_channel_limit, limits.read_channel_limit);
            }
            ConfigPayload::Limits(limits) => {
                tracing::debug!(host = %limits.host_id, "limits for another host ignored");
            }
            ConfigPayload::HostConfig(config) => self.hosts.upsert_config(config.clone()),
            ConfigPayload::Host(host) => self.hosts.upsert_host(host.clone()),
            ConfigPayload::Rule(rule) => {
                tracing::info!(rule = %rule.name, "rule updated");
                self.rules.insert(rule.clone());
            }
        }
    }
}

// ---

pub fn compose_transfer_id(prefix: u32, seq: i64) -> i64 {
    ((prefix as i64) << 32) | (seq & 0xffff_ffff)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::{context_no_store, context_with_store};
    use r66_domain::LimitConfig;

    fn key(id: i64) -> TransferKey {
        TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: id,
        }
    }

    #[test]
    fn claim_is_exclusive_until_guard_drops() {
        // ---
        let active = Arc::new(ActiveTransfers::default());
        assert!(active.try_claim(key(1)));
        assert!(!active.try_claim(key(1)), "second claim of a live key must fail");

        let guard = ActiveGuard::new(active.clone(), key(1));
        drop(guard);
        assert!(active.try_claim(key(1)), "dropped guard frees the key");
    }

    #[test]
    fn transfer_id_keeps_prefix_in_high_bits() {
        // ---
        let id = compose_transfer_id(3, 0x1_0000_0005);
        assert_eq!(id >> 32, 3);
        assert_eq!(id & 0xffff_ffff, 5, "sequence is truncated to 32 bits");
    }

    #[test]
    fn rule_paths_override_host_paths() {
        // ---
        let paths = PathsConfig::under("/srv/r66");
        let mut rule = Rule::named("r");
        rule.recv_path = Some("special/in".into());
        let p = paths.for_rule(&rule);
        assert_eq!(p.in_path, PathBuf::from("/srv/r66/special/in"));
        assert_eq!(p.out_path, PathBuf::from("/srv/r66/out"));
    }

    #[tokio::test]
    async fn limits_for_this_host_reconfigure_shaper() {
        // ---
        let (ctx, _dir) = context_no_store("hosta");
        ctx.apply_config(&ConfigPayload::Limits(LimitConfig {
            host_id: "hosta".into(),
            write_global_limit: 1_000,
            read_global_limit: 2_000,
            write_channel_limit: 300,
            read_channel_limit: 400,
            check_interval_ms: 500,
        }));
        assert_eq!(ctx.shaper().write_global_limit(), 1_000);
        assert_eq!(ctx.shaper().read_channel_limit(), 400);

        ctx.apply_config(&ConfigPayload::Limits(LimitConfig {
            host_id: "other".into(),
            write_global_limit: 9,
            ..Default::default()
        }));
        assert_eq!(ctx.shaper().write_global_limit(), 1_000, "foreign limits ignored");
    }

    #[tokio::test]
    async fn save_inserts_missing_row() {
        // ---
        let (ctx, store, _dir) = context_with_store("hosta");
        let rec = TransferRecord::new("hosta", key(9), "default", true, "a.txt");
        ctx.save(&rec).await.unwrap();
        assert_eq!(store.transfer(&key(9)).map(|r| r.rule_name), Some("default".into()));
    }

    #[tokio::test]
    async fn store_less_requeue_goes_back_on_fifo() {
        // ---
        let (ctx, dir) = context_no_store("hosta");
        let rec = TransferRecord::new("hosta", key(4), "default", true, "a.txt");
        ctx.requeue(rec).await.unwrap();

        assert_eq!(ctx.todo().len(), 1);
        let marker = dir.path().join("arch").join("hosta_hostb_4.json");
        assert!(marker.exists(), "requeue writes the archive marker");
        let loaded = ctx.load(&key(4)).await.unwrap();
        assert_eq!(loaded.updated_info, UpdatedInfo::ToSubmit);
    }
}
