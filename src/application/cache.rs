use super::store::PositionStore;
use crate::domain::position::{clamp_position, PositionRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Snapshot of a record that still has to reach the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommit {
    pub video_id: String,
    pub position: f64,
    revision: u64,
    epoch: u64,
}

/// Proof that a remote fetch was started against a given cache generation.
#[derive(Debug, Clone, Copy)]
pub struct RemoteToken {
    epoch: u64,
}

struct CacheEntry {
    record: PositionRecord,
    /// A value came from a store, a save, or a sample
    known: bool,
    /// The current session passed a verification check
    settled: bool,
    last_observed: Option<f64>,
    revision: u64,
    durable_revision: u64,
    remote_revision: u64,
}

impl CacheEntry {
    fn new(video_id: &str) -> Self {
        Self::from_record(PositionRecord::new(video_id), false)
    }

    fn from_record(record: PositionRecord, known: bool) -> Self {
        Self {
            record,
            known,
            settled: false,
            last_observed: None,
            revision: 0,
            durable_revision: 0,
            remote_revision: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.revision > self.durable_revision
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_revision: u64,
    /// Bumped whenever records are dropped, invalidating in-flight remote work
    epoch: u64,
}

impl CacheState {
    fn entry(&mut self, video_id: &str) -> &mut CacheEntry {
        self.entries
            .entry(video_id.to_string())
            .or_insert_with(|| CacheEntry::new(video_id))
    }

    fn write(&mut self, video_id: &str, position: f64) -> &mut CacheEntry {
        self.last_revision += 1;
        let revision = self.last_revision;
        let entry = self.entry(video_id);
        entry.record.position = position;
        entry.record.last_saved_at = Some(Utc::now());
        entry.known = true;
        entry.revision = revision;
        entry
    }
}

/// In-memory, authoritative view of every position.
///
/// Readers only ever see the cache; the store is written on `flush`.
pub struct PositionCache {
    store: PositionStore,
    state: Mutex<CacheState>,
}

impl PositionCache {
    /// Build the cache from whatever the store currently holds.
    pub fn load(store: PositionStore) -> Self {
        let entries = store
            .load()
            .into_iter()
            .map(|(video_id, record)| (video_id, CacheEntry::from_record(record, true)))
            .collect();
        Self {
            store,
            state: Mutex::new(CacheState {
                entries,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached position, 0 for ids never seen.
    pub fn get(&self, video_id: &str) -> f64 {
        self.lock().entry(video_id).record.position
    }

    /// Whether any value is known for the id.
    pub fn contains(&self, video_id: &str) -> bool {
        self.lock()
            .entries
            .get(video_id)
            .is_some_and(|entry| entry.known)
    }

    /// Overwrite the position and mark it dirty.
    pub fn set(&self, video_id: &str, position: f64) {
        let position = clamp_position(position);
        self.lock().write(video_id, position);
    }

    /// Record a time sampled from a live player.
    ///
    /// Until the current session is settled by a verification, a sample
    /// behind the cached position is ignored: it is the player restarting
    /// from 0 before the restore seek took effect.
    pub fn record_sample(&self, video_id: &str, time: f64) -> bool {
        let time = clamp_position(time);
        let mut state = self.lock();
        let entry = state.entry(video_id);
        entry.last_observed = Some(time);

        if time < entry.record.position && !entry.settled {
            debug!(
                video_id,
                time,
                cached = entry.record.position,
                "Ignoring backward sample before verification"
            );
            return false;
        }
        if entry.known && time == entry.record.position {
            return true;
        }
        state.write(video_id, time);
        true
    }

    /// Record the baseline established by a verification check.
    pub fn record_verified(&self, video_id: &str, baseline: f64) {
        let baseline = clamp_position(baseline);
        let mut state = self.lock();
        let entry = state.write(video_id, baseline);
        entry.record.last_verified_at = Some(Utc::now());
        entry.settled = true;
        entry.last_observed = Some(baseline);
    }

    /// Last time observed from a player for the id, accepted or not.
    pub fn last_observed(&self, video_id: &str) -> Option<f64> {
        self.lock()
            .entries
            .get(video_id)
            .and_then(|entry| entry.last_observed)
    }

    /// Open a session: bump the count and require a fresh verification.
    pub fn begin_session(&self, video_id: &str) -> u32 {
        let mut state = self.lock();
        let entry = state.entry(video_id);
        entry.record.active_session_count = entry.record.active_session_count.saturating_add(1);
        entry.settled = false;
        entry.last_observed = None;
        entry.record.active_session_count
    }

    /// Close a session. Closing without an open session is a no-op.
    pub fn end_session(&self, video_id: &str) -> u32 {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(video_id) else {
            debug!(video_id, "Session closed for unknown video");
            return 0;
        };
        if entry.record.active_session_count == 0 {
            debug!(video_id, "Session count already 0");
            return 0;
        }
        entry.record.active_session_count -= 1;
        entry.record.active_session_count
    }

    pub fn session_count(&self, video_id: &str) -> u32 {
        self.lock()
            .entries
            .get(video_id)
            .map_or(0, |entry| entry.record.active_session_count)
    }

    pub fn is_dirty(&self, video_id: &str) -> bool {
        self.lock()
            .entries
            .get(video_id)
            .is_some_and(CacheEntry::is_dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.lock().entries.values().filter(|e| e.is_dirty()).count()
    }

    fn persist(&self, state: &mut CacheState) -> bool {
        let written = self.store.write(
            state
                .entries
                .values()
                .filter(|entry| entry.known)
                .map(|entry| &entry.record),
        );
        match written {
            Ok(()) => {
                for entry in state.entries.values_mut() {
                    entry.durable_revision = entry.revision;
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Position flush failed, keeping records dirty");
                false
            }
        }
    }

    /// Write every dirty record to the store. Returns how many were dirty
    /// and are now durable.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        let dirty = state.entries.values().filter(|e| e.is_dirty()).count();
        if dirty == 0 || !self.persist(&mut state) {
            return 0;
        }
        debug!(dirty, "Flushed positions");
        dirty
    }

    /// Drop one record from the cache and the store.
    pub fn remove(&self, video_id: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.remove(video_id) else {
            return false;
        };
        state.epoch += 1;
        if entry.known {
            self.persist(&mut state);
        }
        entry.known
    }

    /// Drop every record from the cache and the store.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.epoch += 1;
        self.store.clear();
    }

    /// Records whose latest revision the remote store has not acknowledged.
    pub fn pending_commits(&self) -> Vec<PendingCommit> {
        let state = self.lock();
        state
            .entries
            .values()
            .filter(|entry| entry.known && entry.revision > entry.remote_revision)
            .map(|entry| PendingCommit {
                video_id: entry.record.video_id.clone(),
                position: entry.record.position,
                revision: entry.revision,
                epoch: state.epoch,
            })
            .collect()
    }

    /// Note a remote acknowledgement. Never changes the cached position.
    pub fn acknowledge_commit(&self, commit: &PendingCommit) {
        let mut state = self.lock();
        if state.epoch != commit.epoch {
            return;
        }
        if let Some(entry) = state.entries.get_mut(&commit.video_id) {
            entry.remote_revision = entry.remote_revision.max(commit.revision);
        }
    }

    /// Token for a remote fetch, or `None` when a local value already exists.
    pub fn remote_token(&self, video_id: &str) -> Option<RemoteToken> {
        let state = self.lock();
        let known = state.entries.get(video_id).is_some_and(|e| e.known);
        (!known).then_some(RemoteToken { epoch: state.epoch })
    }

    /// Apply a fetched remote position unless the cache learned a value,
    /// or was cleared, while the fetch was in flight.
    pub fn apply_remote(&self, video_id: &str, position: f64, token: RemoteToken) -> bool {
        let position = clamp_position(position);
        let mut state = self.lock();
        let known = state.entries.get(video_id).is_some_and(|e| e.known);
        if state.epoch != token.epoch || known || position == 0.0 {
            return false;
        }
        let entry = state.write(video_id, position);
        entry.remote_revision = entry.revision;
        true
    }

    /// Copy of every record, sorted by id.
    pub fn records(&self) -> Vec<PositionRecord> {
        let mut records: Vec<PositionRecord> = self
            .lock()
            .entries
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.video_id.cmp(&b.video_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::MemoryStorage;
    use crate::domain::position::decode_table;
    use crate::ports::storage::KeyValueStore;

    fn cache_with(persistent: &MemoryStorage) -> PositionCache {
        PositionCache::load(PositionStore::new("videoPositions").with_persistent(persistent.clone()))
    }

    fn stored(medium: &MemoryStorage) -> HashMap<String, PositionRecord> {
        decode_table(&medium.get("videoPositions").unwrap().unwrap_or_default()).unwrap_or_default()
    }

    #[test]
    fn test_unknown_id_defaults_to_zero() {
        let cache = cache_with(&MemoryStorage::new());
        assert_eq!(cache.get("never-saved"), 0.0);
        assert!(!cache.contains("never-saved"));
        assert!(!cache.is_dirty("never-saved"));
    }

    #[test]
    fn test_set_is_visible_immediately() {
        let persistent = MemoryStorage::new();
        let cache = cache_with(&persistent);

        cache.set("abc", 42.5);
        assert_eq!(cache.get("abc"), 42.5);
        assert!(cache.is_dirty("abc"));
        // Nothing reaches the store before a flush
        assert!(persistent.get("videoPositions").unwrap().is_none());
    }

    #[test]
    fn test_negative_set_is_clamped() {
        let cache = cache_with(&MemoryStorage::new());
        cache.set("abc", -5.0);
        assert_eq!(cache.get("abc"), 0.0);
    }

    #[test]
    fn test_flush_writes_dirty_records() {
        let persistent = MemoryStorage::new();
        let cache = cache_with(&persistent);
        cache.set("abc", 42.5);
        cache.set("def", 7.0);

        assert_eq!(cache.flush(), 2);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(stored(&persistent)["abc"].position, 42.5);

        // Nothing dirty, nothing written
        assert_eq!(cache.flush(), 0);
    }

    #[test]
    fn test_failed_flush_keeps_records_dirty() {
        let full = MemoryStorage::with_quota(2);
        let cache = cache_with(&full);
        cache.set("abc", 42.5);

        assert_eq!(cache.flush(), 0);
        assert!(cache.is_dirty("abc"));
        assert_eq!(cache.get("abc"), 42.5);
    }

    #[test]
    fn test_load_reads_store() {
        let persistent = MemoryStorage::new();
        persistent.set("videoPositions", r#"{"abc": 33}"#).unwrap();
        let cache = cache_with(&persistent);
        assert_eq!(cache.get("abc"), 33.0);
        assert!(!cache.is_dirty("abc"));
    }

    #[test]
    fn test_backward_sample_ignored_until_settled() {
        let cache = cache_with(&MemoryStorage::new());
        cache.set("abc", 100.0);
        cache.begin_session("abc");

        assert!(!cache.record_sample("abc", 0.5));
        assert_eq!(cache.get("abc"), 100.0);
        assert_eq!(cache.last_observed("abc"), Some(0.5));

        assert!(cache.record_sample("abc", 103.0));
        assert_eq!(cache.get("abc"), 103.0);

        cache.record_verified("abc", 103.0);
        // A rewind after verification is the user's choice
        assert!(cache.record_sample("abc", 20.0));
        assert_eq!(cache.get("abc"), 20.0);
    }

    #[test]
    fn test_new_session_requires_verification_again() {
        let cache = cache_with(&MemoryStorage::new());
        cache.record_verified("abc", 50.0);
        cache.begin_session("abc");
        assert!(!cache.record_sample("abc", 0.0));
        assert_eq!(cache.get("abc"), 50.0);
    }

    #[test]
    fn test_session_count_clamps_at_zero() {
        let cache = cache_with(&MemoryStorage::new());
        assert_eq!(cache.end_session("abc"), 0);
        assert_eq!(cache.begin_session("abc"), 1);
        assert_eq!(cache.begin_session("abc"), 2);
        assert_eq!(cache.end_session("abc"), 1);
        assert_eq!(cache.end_session("abc"), 0);
        assert_eq!(cache.end_session("abc"), 0);
        assert_eq!(cache.session_count("abc"), 0);
    }

    #[test]
    fn test_acknowledgement_never_touches_position() {
        let cache = cache_with(&MemoryStorage::new());
        cache.set("abc", 10.0);
        let stale = cache.pending_commits();
        cache.set("abc", 20.0);

        cache.acknowledge_commit(&stale[0]);
        assert_eq!(cache.get("abc"), 20.0);

        // The newer value still needs committing
        let pending = cache.pending_commits();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].position, 20.0);

        cache.acknowledge_commit(&pending[0]);
        assert!(cache.pending_commits().is_empty());
        // A late stale ack does not regress the bookkeeping
        cache.acknowledge_commit(&stale[0]);
        assert!(cache.pending_commits().is_empty());
    }

    #[test]
    fn test_remote_value_loses_to_set_during_fetch() {
        let cache = cache_with(&MemoryStorage::new());
        let token = cache.remote_token("abc").unwrap();
        cache.set("abc", 5.0);
        assert!(!cache.apply_remote("abc", 80.0, token));
        assert_eq!(cache.get("abc"), 5.0);
        assert!(cache.remote_token("abc").is_none());
    }

    #[test]
    fn test_remote_value_applies_to_unknown_id() {
        let cache = cache_with(&MemoryStorage::new());
        let token = cache.remote_token("abc").unwrap();
        assert!(cache.apply_remote("abc", 80.0, token));
        assert_eq!(cache.get("abc"), 80.0);
        // Came from the remote, so nothing to commit back
        assert!(cache.pending_commits().is_empty());
        assert!(cache.is_dirty("abc"));
    }

    #[test]
    fn test_remote_value_dropped_after_clear() {
        let persistent = MemoryStorage::new();
        let cache = cache_with(&persistent);
        let token = cache.remote_token("abc").unwrap();
        cache.clear();
        assert!(!cache.apply_remote("abc", 80.0, token));
        assert_eq!(cache.get("abc"), 0.0);
    }

    #[test]
    fn test_remove_rewrites_store() {
        let persistent = MemoryStorage::new();
        let cache = cache_with(&persistent);
        cache.set("abc", 1.0);
        cache.set("def", 2.0);
        cache.flush();

        assert!(cache.remove("abc"));
        assert!(!cache.remove("abc"));
        let table = stored(&persistent);
        assert!(!table.contains_key("abc"));
        assert_eq!(table["def"].position, 2.0);
    }

    #[test]
    fn test_clear_empties_cache_and_store() {
        let persistent = MemoryStorage::new();
        let cache = cache_with(&persistent);
        cache.set("abc", 1.0);
        cache.flush();

        cache.clear();
        assert_eq!(cache.get("abc"), 0.0);
        assert!(persistent.get("videoPositions").unwrap().is_none());
        assert_eq!(cache.records().len(), 1);
        assert!(!cache.contains("abc"));
    }
}
