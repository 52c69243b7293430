use std::collections::HashMap;
use std::time::Duration;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

// ---

use r66_domain::{
    // ---
    ConfigRow,
    EntityKind,
    GlobalStep,
    MonitorLock,
    PersistentStore,
    StepStatus,
    StoreError,
    StoreResult,
    TransferKey,
    TransferRecord,
    UpdatedInfo,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// [`PersistentStore`] kept in process memory.
///
/// Test hooks:
/// - [`MemoryStore::fail_next`] makes the next trait call fail;
/// - [`MemoryStore::set_lock_busy`] simulates another instance holding the
///   monitor lock;
/// - [`MemoryStore::set_query_delay`] makes `query_by_flag` yield for a
///   while, keeping a commander tick in flight.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // ---
    transfers: HashMap<TransferKey, TransferRecord>,
    rows: HashMap<(EntityKind, String), ConfigRow>,
    next_sequence: i64,

    /// Counters persisted by the last `release_monitor`.
    monitor: Option<MonitorLock>,
    monitor_held: bool,
    monitor_taken: usize,
    lock_busy: bool,
    query_delay: Duration,

    fail_next: Option<StoreError>,
}

impl Inner {
    // ---
    fn check(&mut self) -> StoreResult<()> {
        match self.fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---

impl MemoryStore {
    // ---
    pub fn transfer(&self, key: &TransferKey) -> Option<TransferRecord> {
        self.inner.lock().transfers.get(key).cloned()
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.inner.lock().transfers.values().cloned().collect()
    }

    /// Insert or overwrite a transfer row directly.
    pub fn put_transfer(&self, record: TransferRecord) {
        self.inner.lock().transfers.insert(record.key(), record);
    }

    // ---

    pub fn insert_row(&self, row: ConfigRow) {
        // ---
        let id = (row.payload.kind(), row.payload.id().to_string());
        self.inner.lock().rows.insert(id, row);
    }

    pub fn config_flag(&self, kind: EntityKind, id: &str) -> Option<UpdatedInfo> {
        self.inner
            .lock()
            .rows
            .get(&(kind, id.to_string()))
            .map(|r| r.updated_info)
    }

    // ---

    /// The next trait call returns `err` instead of doing its work.
    pub fn fail_next(&self, err: StoreError) {
        self.inner.lock().fail_next = Some(err);
    }

    pub fn set_lock_busy(&self, busy: bool) {
        self.inner.lock().lock_busy = busy;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.inner.lock().query_delay = delay;
    }

    // ---

    /// Whether some instance holds the monitor lock right now.
    pub fn monitor_held(&self) -> bool {
        self.inner.lock().monitor_held
    }

    /// How many times the monitor lock was granted.
    pub fn monitor_taken(&self) -> usize {
        self.inner.lock().monitor_taken
    }
}

// ---

#[async_trait]
impl PersistentStore for MemoryStore {
    // ---
    async fn query_updated(&self, kind: EntityKind) -> StoreResult<Vec<ConfigRow>> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .rows
            .iter()
            .filter(|((k, _), row)| *k == kind && row.updated_info == UpdatedInfo::ToSubmit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn update_config(&self, row: &ConfigRow) -> StoreResult<()> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        let id = (row.payload.kind(), row.payload.id().to_string());
        match inner.rows.get_mut(&id) {
            Some(slot) => {
                *slot = row.clone();
                Ok(())
            }
            None => Err(StoreError::NoData),
        }
    }

    async fn query_by_flag(
        &self,
        flag: UpdatedInfo,
        limit: usize,
    ) -> StoreResult<Vec<TransferRecord>> {
        // ---
        let delay = self.inner.lock().query_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        inner.check()?;
        let mut hits: Vec<TransferRecord> = inner
            .transfers
            .values()
            .filter(|r| r.updated_info == flag)
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.start.cmp(&b.start).then(a.transfer_id.cmp(&b.transfer_id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn load_transfer(&self, key: &TransferKey) -> StoreResult<TransferRecord> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.transfers.get(key).cloned().ok_or(StoreError::NoData)
    }

    async fn insert_transfer(&self, record: &TransferRecord) -> StoreResult<()> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        let key = record.key();
        if inner.transfers.contains_key(&key) {
            return Err(StoreError::Sql(format!("duplicate key {key}")));
        }
        inner.transfers.insert(key, record.clone());
        Ok(())
    }

    async fn update_transfer(&self, record: &TransferRecord) -> StoreResult<()> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        match inner.transfers.get_mut(&record.key()) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::NoData),
        }
    }

    async fn next_sequence_value(&self) -> StoreResult<i64> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        let value = inner.next_sequence;
        inner.next_sequence += 1;
        Ok(value)
    }

    async fn reset_sequence(&self, value: i64) -> StoreResult<()> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.next_sequence = value;
        Ok(())
    }

    async fn reset_to_submit(&self) -> StoreResult<u64> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        let mut changed = 0;
        for rec in inner.transfers.values_mut() {
            if matches!(rec.updated_info, UpdatedInfo::Running | UpdatedInfo::Interrupted) {
                rec.updated_info = UpdatedInfo::ToSubmit;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn change_finished_to_done(&self) -> StoreResult<u64> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        let mut changed = 0;
        for rec in inner.transfers.values_mut() {
            if rec.global_step == GlobalStep::AllDone
                && rec.status == StepStatus::Ok
                && rec.updated_info != UpdatedInfo::Done
            {
                rec.updated_info = UpdatedInfo::Done;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn try_lock_monitor(
        &self,
        holder: Uuid,
        instances: u32,
    ) -> StoreResult<Option<MonitorLock>> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        if inner.lock_busy || inner.monitor_held {
            return Ok(None);
        }
        inner.monitor_held = true;
        inner.monitor_taken += 1;

        let mut lock = MonitorLock::new(holder, instances);
        if let Some(saved) = &inner.monitor {
            lock.config_seen = saved.config_seen;
            lock.host_seen = saved.host_seen;
            lock.rule_seen = saved.rule_seen;
        }
        Ok(Some(lock))
    }

    async fn release_monitor(&self, lock: MonitorLock) -> StoreResult<()> {
        // ---
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.monitor = Some(lock);
        inner.monitor_held = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, Utc};

    fn record(id: i64) -> TransferRecord {
        let key = TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: id,
        };
        TransferRecord::new("hosta", key, "default", true, "f")
    }

    #[tokio::test]
    async fn query_orders_by_start_then_id_and_limits() {
        // ---
        let store = MemoryStore::default();
        let now = Utc::now();
        for (id, age) in [(3, 0), (1, 10), (2, 10)] {
            let mut r = record(id);
            r.start = now - Duration::seconds(age);
            store.put_transfer(r);
        }

        let hits = store.query_by_flag(UpdatedInfo::ToSubmit, 2).await.unwrap();
        let ids: Vec<i64> = hits.iter().map(|r| r.transfer_id).collect();
        assert_eq!(ids, vec![1, 2], "oldest first, id breaks ties, limit applies");
    }

    #[tokio::test]
    async fn injected_failure_hits_one_call() {
        // ---
        let store = MemoryStore::default();
        store.fail_next(StoreError::NoConnection("down".into()));
        assert!(matches!(
            store.next_sequence_value().await,
            Err(StoreError::NoConnection(_))
        ));
        assert_eq!(store.next_sequence_value().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn monitor_is_exclusive_and_keeps_counters() {
        // ---
        let store = MemoryStore::default();
        let mut lock = store.try_lock_monitor(Uuid::new_v4(), 2).await.unwrap().unwrap();
        assert!(store.try_lock_monitor(Uuid::new_v4(), 2).await.unwrap().is_none());

        assert!(!lock.check_update_rule());
        store.release_monitor(lock).await.unwrap();

        let mut lock = store.try_lock_monitor(Uuid::new_v4(), 2).await.unwrap().unwrap();
        assert!(lock.check_update_rule(), "count carried over from the last holder");
        assert!(store.monitor_held());
        assert_eq!(store.monitor_taken(), 2, "refused attempt not counted");
    }

    #[tokio::test]
    async fn update_of_missing_row_is_no_data() {
        let store = MemoryStore::default();
        let err = store.update_transfer(&record(5)).await.unwrap_err();
        assert_eq!(err, StoreError::NoData);
    }
}
