use super::autosave::{AutosaveLoop, SaveThrottle};
use super::cache::PositionCache;
use super::registry::SessionRegistry;
use super::remote::RemoteSync;
use super::store::PositionStore;
use super::verification::VerificationScheduler;
use crate::adapters::http::HttpPositionStore;
use crate::adapters::local::{FsStorage, MemoryStorage};
use crate::config::EngineConfig;
use crate::domain::player::PlayerState;
use crate::domain::position::PositionRecord;
use crate::ports::player::PlayerHandle;
use crate::ports::remote::RemotePositionStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared access point for playback positions.
///
/// Construct once, share behind an `Arc`, and call `shutdown` (or drop it)
/// to cancel every timer and flush what is still dirty.
pub struct PositionEngine {
    config: EngineConfig,
    cache: Arc<PositionCache>,
    registry: SessionRegistry,
    verifier: VerificationScheduler,
    autosave: AutosaveLoop,
    throttle: SaveThrottle,
    remote: Option<RemoteSync>,
}

impl PositionEngine {
    /// Build an engine over `store`, loading every position it holds.
    pub fn new(config: EngineConfig, store: PositionStore) -> Self {
        let cache = Arc::new(PositionCache::load(store));
        Self {
            registry: SessionRegistry::new(cache.clone()),
            verifier: VerificationScheduler::new(
                cache.clone(),
                config.verification_delay,
                config.drift_threshold,
            ),
            autosave: AutosaveLoop::new(cache.clone(), config.autosave_interval),
            throttle: SaveThrottle::new(config.save_throttle),
            remote: None,
            cache,
            config,
        }
    }

    /// File-backed persistent tier, in-memory session tier, and the remote
    /// service when `remote_url` is set.
    pub fn from_config(config: EngineConfig) -> Self {
        let store = PositionStore::new(&config.namespace)
            .with_persistent(FsStorage::new(&config.storage_dir))
            .with_session(MemoryStorage::new());

        let remote = config.remote_url.as_deref().and_then(|url| {
            match HttpPositionStore::new(url, config.remote_timeout) {
                Ok(remote) => Some(remote),
                Err(e) => {
                    warn!(url, error = %e, "Remote position store disabled");
                    None
                }
            }
        });

        let engine = Self::new(config, store);
        match remote {
            Some(remote) => engine.with_remote(Arc::new(remote)),
            None => engine,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemotePositionStore>) -> Self {
        let sync = RemoteSync::new(remote, self.cache.clone());
        self.autosave.attach_remote(sync.clone());
        self.remote = Some(sync);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cached position, 0 when nothing is known. Never blocks.
    pub fn get_position(&self, video_id: &str) -> f64 {
        self.cache.get(video_id)
    }

    /// Like `get_position`, but asks the remote store first for ids the
    /// cache knows nothing about.
    pub async fn resolve_position(&self, video_id: &str) -> f64 {
        match &self.remote {
            Some(remote) => remote.hydrate(video_id).await,
            None => self.cache.get(video_id),
        }
    }

    /// Explicit save; overwrites the cached position and flushes.
    pub fn save_position(&self, video_id: &str, position: f64) {
        self.cache.set(video_id, position);
        self.flush();
    }

    /// Open a session. Timers left over from an earlier session on the
    /// same id are cancelled; `bind_player` starts the new autosave loop.
    pub fn register_session(&self, video_id: &str) -> u32 {
        self.verifier.clear(video_id);
        self.autosave.stop(video_id);
        self.registry.register(video_id)
    }

    /// Bind a ready player and start sampling it.
    pub fn bind_player(&self, video_id: &str, player: PlayerHandle) {
        if let Some(previous) = self.registry.bind(video_id, player.clone()) {
            if !previous.same_binding(&player) {
                debug!(video_id, "Rebinding video to a new player");
            }
        }
        self.autosave.start(video_id, player);
    }

    /// Close a session: save the last known time, cancel its timers, and
    /// flush.
    pub fn unregister_session(&self, video_id: &str) -> u32 {
        let bound = self.registry.unbind(video_id);
        let last_time = bound
            .and_then(|player| player.current_time().ok())
            .or_else(|| self.cache.last_observed(video_id));
        if let Some(time) = last_time {
            self.cache.record_sample(video_id, time);
        }

        self.verifier.clear(video_id);
        self.autosave.stop(video_id);
        let remaining = self.registry.unregister(video_id);
        self.flush();
        remaining
    }

    /// Close the session owned by one host. Timers and the binding are only
    /// torn down if `player` is still the bound player; a host that
    /// re-mounted in the meantime keeps its own.
    pub fn end_session(&self, video_id: &str, player: Option<&PlayerHandle>) -> u32 {
        if let Some(player) = player {
            if self.registry.is_bound(video_id, player) {
                return self.unregister_session(video_id);
            }
            if let Ok(time) = player.current_time() {
                self.cache.record_sample(video_id, time);
            }
            self.verifier.clear_for(video_id, player);
        }
        let remaining = self.registry.unregister(video_id);
        self.flush();
        remaining
    }

    pub fn schedule_verification(&self, video_id: &str, player: PlayerHandle) {
        self.verifier.schedule(video_id, player);
    }

    pub fn clear_verification(&self, video_id: &str) -> bool {
        self.verifier.clear(video_id)
    }

    /// React to a player state notification.
    pub fn handle_state_change(&self, video_id: &str, player: &PlayerHandle, state: PlayerState) {
        match state {
            PlayerState::Playing => {
                self.schedule_verification(video_id, player.clone());
                if self.throttle.try_acquire(video_id) {
                    self.sample(video_id, player);
                }
            }
            PlayerState::Paused | PlayerState::Ended => {
                self.sample(video_id, player);
                self.flush();
            }
            PlayerState::Unstarted | PlayerState::Buffering | PlayerState::Cued => {}
        }
    }

    fn sample(&self, video_id: &str, player: &PlayerHandle) {
        match player.current_time() {
            Ok(time) => {
                self.cache.record_sample(video_id, time);
            }
            Err(e) => debug!(video_id, error = %e, "Sample skipped"),
        }
    }

    /// Forget one video's position everywhere local. Its timers stop so no
    /// tick brings the record back; the session and binding stay open.
    pub fn clear_position(&self, video_id: &str) -> bool {
        self.verifier.clear(video_id);
        self.autosave.stop(video_id);
        self.cache.remove(video_id)
    }

    /// Empty the cache and the local store and cancel every timer.
    pub fn clear_all_positions(&self) {
        self.verifier.clear_all();
        self.autosave.stop_all();
        self.registry.clear();
        self.throttle.clear();
        self.cache.clear();
        info!("Cleared all positions");
    }

    /// Write dirty records to the local tiers and push them to the remote
    /// store in the background.
    pub fn flush(&self) -> usize {
        let written = self.cache.flush();
        if let Some(remote) = &self.remote {
            remote.spawn_commit();
        }
        written
    }

    /// Timers still armed: pending verifications plus autosave loops.
    pub fn pending_timers(&self) -> usize {
        self.verifier.pending_count() + self.autosave.running_count()
    }

    pub fn is_verification_pending(&self, video_id: &str) -> bool {
        self.verifier.is_pending(video_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.active_ids()
    }

    /// Diagnostic copy of every record.
    pub fn records(&self) -> Vec<PositionRecord> {
        self.cache.records()
    }

    fn save_bound_players(&self) {
        for (video_id, player) in self.autosave.players() {
            if let Ok(time) = player.current_time() {
                self.cache.record_sample(&video_id, time);
            }
        }
    }

    /// Final save of every live player, cancel all timers, flush, and wait
    /// for outstanding remote commits.
    pub async fn shutdown(&self) {
        self.save_bound_players();
        self.verifier.clear_all();
        self.autosave.stop_all();
        let written = self.cache.flush();
        let committed = match &self.remote {
            Some(remote) => remote.commit_pending().await,
            None => 0,
        };
        info!(written, committed, "Position engine shut down");
    }
}

impl Drop for PositionEngine {
    fn drop(&mut self) {
        self.save_bound_players();
        self.verifier.clear_all();
        self.autosave.stop_all();
        self.cache.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::decode_table;
    use crate::error::PositionError;
    use crate::ports::player::testing::ScriptedPlayer;
    use crate::ports::remote::MockRemotePositionStore;
    use crate::ports::storage::KeyValueStore;
    use std::time::Duration;

    fn engine_with(persistent: &MemoryStorage, session: &MemoryStorage) -> PositionEngine {
        PositionEngine::new(
            EngineConfig::default(),
            PositionStore::new("videoPositions")
                .with_persistent(persistent.clone())
                .with_session(session.clone()),
        )
    }

    fn stored(medium: &MemoryStorage, video_id: &str) -> Option<f64> {
        let raw = medium.get("videoPositions").unwrap()?;
        decode_table(&raw).unwrap().get(video_id).map(|r| r.position)
    }

    #[test]
    fn test_default_and_round_trip() {
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new());
        assert_eq!(engine.get_position("never-saved"), 0.0);

        engine.save_position("abc", 42.5);
        assert_eq!(engine.get_position("abc"), 42.5);
    }

    #[test]
    fn test_session_value_takes_precedence() {
        let persistent = MemoryStorage::new();
        let session = MemoryStorage::new();
        persistent.set("videoPositions", r#"{"abc": 5}"#).unwrap();
        session.set("videoPositions", r#"{"abc": 10}"#).unwrap();

        let engine = engine_with(&persistent, &session);
        assert_eq!(engine.get_position("abc"), 10.0);
    }

    #[test]
    fn test_save_position_is_durable() {
        let persistent = MemoryStorage::new();
        let session = MemoryStorage::new();
        let engine = engine_with(&persistent, &session);

        engine.save_position("abc", 42.5);
        assert_eq!(stored(&persistent, "abc"), Some(42.5));
        assert_eq!(stored(&session, "abc"), Some(42.5));
    }

    #[test]
    fn test_broken_storage_never_surfaces() {
        let engine = engine_with(&MemoryStorage::with_quota(1), &MemoryStorage::with_quota(1));
        engine.save_position("abc", 42.5);
        assert_eq!(engine.get_position("abc"), 42.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_flushes_last_time_before_autosave_tick() {
        let persistent = MemoryStorage::new();
        let engine = engine_with(&persistent, &MemoryStorage::new());
        let player = Arc::new(ScriptedPlayer::at(0.0));
        let handle = PlayerHandle::new(player.clone());

        engine.register_session("abc");
        engine.bind_player("abc", handle);
        player.set_time(37.0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(stored(&persistent, "abc"), None);

        assert_eq!(engine.unregister_session("abc"), 0);
        assert_eq!(stored(&persistent, "abc"), Some(37.0));
        assert_eq!(engine.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_uses_last_sample_of_destroyed_player() {
        let persistent = MemoryStorage::new();
        let engine = engine_with(&persistent, &MemoryStorage::new());
        let player = Arc::new(ScriptedPlayer::at(12.0));
        let handle = PlayerHandle::new(player.clone());

        engine.register_session("abc");
        engine.handle_state_change("abc", &handle, PlayerState::Playing);
        handle.destroy();

        engine.unregister_session("abc");
        assert_eq!(stored(&persistent, "abc"), Some(12.0));
        assert!(!engine.is_verification_pending("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_arms_verification_that_corrects_drift() {
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new());
        engine.save_position("abc", 100.0);
        let player = Arc::new(ScriptedPlayer::at(0.0));
        let handle = PlayerHandle::new(player.clone());

        engine.register_session("abc");
        engine.handle_state_change("abc", &handle, PlayerState::Playing);
        // The early sample at 0 must not clobber the saved position
        assert_eq!(engine.get_position("abc"), 100.0);
        assert!(engine.is_verification_pending("abc"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(player.seeks(), vec![(100.0, true)]);
        assert_eq!(engine.get_position("abc"), 100.0);
        assert!(!engine.is_verification_pending("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_schedule_leaves_one_timer() {
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new());
        let handle = PlayerHandle::new(Arc::new(ScriptedPlayer::at(0.0)));

        engine.schedule_verification("abc", handle.clone());
        engine.schedule_verification("abc", handle);
        assert_eq!(engine.pending_timers(), 1);
        assert!(engine.clear_verification("abc"));
        assert_eq!(engine.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_positions() {
        let persistent = MemoryStorage::new();
        let engine = engine_with(&persistent, &MemoryStorage::new());
        let handle = PlayerHandle::new(Arc::new(ScriptedPlayer::at(30.0)));

        engine.save_position("abc", 30.0);
        engine.save_position("def", 60.0);
        engine.register_session("abc");
        engine.bind_player("abc", handle.clone());
        engine.schedule_verification("abc", handle);
        assert_eq!(engine.pending_timers(), 2);

        engine.clear_all_positions();
        assert_eq!(engine.pending_timers(), 0);
        assert_eq!(engine.get_position("abc"), 0.0);
        assert_eq!(engine.get_position("def"), 0.0);
        assert!(persistent.get("videoPositions").unwrap().is_none());
        assert!(engine.active_sessions().is_empty());

        // Nothing left to fire later
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.get_position("abc"), 0.0);
    }

    #[test]
    fn test_clear_position_keeps_others() {
        let persistent = MemoryStorage::new();
        let engine = engine_with(&persistent, &MemoryStorage::new());
        engine.save_position("abc", 30.0);
        engine.save_position("def", 60.0);

        assert!(engine.clear_position("abc"));
        assert_eq!(engine.get_position("abc"), 0.0);
        assert_eq!(stored(&persistent, "abc"), None);
        assert_eq!(stored(&persistent, "def"), Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistering_cancels_previous_autosave() {
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new());
        let old = Arc::new(ScriptedPlayer::at(40.0));

        engine.register_session("abc");
        engine.bind_player("abc", PlayerHandle::new(old.clone()));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(engine.get_position("abc"), 40.0);

        engine.register_session("abc");
        assert_eq!(engine.pending_timers(), 0);

        old.set_time(77.0);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(engine.get_position("abc"), 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_position_stops_autosave() {
        let persistent = MemoryStorage::new();
        let engine = engine_with(&persistent, &MemoryStorage::new());
        let handle = PlayerHandle::new(Arc::new(ScriptedPlayer::at(30.0)));

        engine.register_session("abc");
        engine.bind_player("abc", handle.clone());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(stored(&persistent, "abc"), Some(30.0));

        engine.schedule_verification("abc", handle);
        assert_eq!(engine.pending_timers(), 2);
        assert!(engine.clear_position("abc"));
        assert_eq!(engine.pending_timers(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stored(&persistent, "abc"), None);
        assert_eq!(engine.active_sessions(), vec!["abc".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_playback_reaches_remote() {
        let committed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut remote = MockRemotePositionStore::new();
        remote.expect_commit_position().returning({
            let committed = committed.clone();
            move |_, position| {
                committed.lock().unwrap().push(position);
                Ok(())
            }
        });
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new())
            .with_remote(Arc::new(remote));
        let player = Arc::new(ScriptedPlayer::at(50.0));

        engine.register_session("abc");
        engine.bind_player("abc", PlayerHandle::new(player.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        for time in [60.0, 70.0, 80.0] {
            tokio::time::sleep(Duration::from_secs(3)).await;
            player.set_time(time);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(engine.get_position("abc"), 80.0);
        assert_eq!(committed.lock().unwrap().last(), Some(&80.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_host_teardown_keeps_new_binding() {
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new());
        let old = PlayerHandle::new(Arc::new(ScriptedPlayer::at(20.0)));
        let new = PlayerHandle::new(Arc::new(ScriptedPlayer::at(21.0)));

        engine.register_session("abc");
        engine.bind_player("abc", old.clone());
        engine.register_session("abc");
        engine.bind_player("abc", new.clone());
        engine.schedule_verification("abc", new.clone());

        assert_eq!(engine.end_session("abc", Some(&old)), 1);
        assert!(engine.is_verification_pending("abc"));
        assert_eq!(engine.active_sessions(), vec!["abc".to_string()]);
        assert_eq!(engine.pending_timers(), 2);

        assert_eq!(engine.end_session("abc", Some(&new)), 0);
        assert_eq!(engine.pending_timers(), 0);
        assert!(engine.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_state_saves_immediately() {
        let persistent = MemoryStorage::new();
        let engine = engine_with(&persistent, &MemoryStorage::new());
        let handle = PlayerHandle::new(Arc::new(ScriptedPlayer::at(44.0)));

        engine.handle_state_change("abc", &handle, PlayerState::Paused);
        assert_eq!(stored(&persistent, "abc"), Some(44.0));
    }

    #[tokio::test]
    async fn test_remote_position_resolves_before_player_exists() {
        let mut remote = MockRemotePositionStore::new();
        remote.expect_fetch_position().returning(|_| Ok(75.0));
        remote.expect_commit_position().returning(|_, _| Ok(()));
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new())
            .with_remote(Arc::new(remote));

        assert_eq!(engine.resolve_position("abc").await, 75.0);
        assert_eq!(engine.get_position("abc"), 75.0);
    }

    #[tokio::test]
    async fn test_unreachable_remote_degrades_to_zero() {
        let mut remote = MockRemotePositionStore::new();
        remote
            .expect_fetch_position()
            .returning(|_| Err(PositionError::RemoteUnreachable("timeout".into())));
        remote
            .expect_commit_position()
            .returning(|_, _| Err(PositionError::RemoteUnreachable("timeout".into())));
        let engine = engine_with(&MemoryStorage::new(), &MemoryStorage::new())
            .with_remote(Arc::new(remote));

        assert_eq!(engine.resolve_position("abc").await, 0.0);
        engine.save_position("abc", 9.0);
        engine.shutdown().await;
        assert_eq!(engine.get_position("abc"), 9.0);
    }

    #[tokio::test]
    async fn test_shutdown_commits_to_remote() {
        let mut remote = MockRemotePositionStore::new();
        remote
            .expect_commit_position()
            .withf(|video_id, position| video_id == "abc" && *position == 42.5)
            .returning(|_, _| Ok(()));
        let engine = PositionEngine::new(EngineConfig::default(), PositionStore::new("videoPositions"))
            .with_remote(Arc::new(remote));

        engine.cache.set("abc", 42.5);
        engine.shutdown().await;
        assert_eq!(engine.pending_timers(), 0);
        assert!(engine.cache.pending_commits().is_empty());
    }

    #[test]
    fn test_drop_flushes_dirty_records() {
        let persistent = MemoryStorage::new();
        {
            let engine = engine_with(&persistent, &MemoryStorage::new());
            engine.cache.set("abc", 8.0);
            assert_eq!(stored(&persistent, "abc"), None);
        }
        assert_eq!(stored(&persistent, "abc"), Some(8.0));
    }
}
