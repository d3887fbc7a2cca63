use super::cache::PositionCache;
use crate::ports::player::PlayerHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Tracks which videos have a player bound right now.
///
/// Session counts live on the cached records and are advisory only; the
/// bound handle is what save and seek paths consult.
pub struct SessionRegistry {
    cache: Arc<PositionCache>,
    bindings: Mutex<HashMap<String, PlayerHandle>>,
}

impl SessionRegistry {
    pub fn new(cache: Arc<PositionCache>) -> Self {
        Self {
            cache,
            bindings: Mutex::default(),
        }
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, PlayerHandle>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a new session, creating the record if needed.
    pub fn register(&self, video_id: &str) -> u32 {
        let count = self.cache.begin_session(video_id);
        debug!(video_id, count, "Session registered");
        count
    }

    /// Drop one session. Unregistering an unknown session is a no-op.
    pub fn unregister(&self, video_id: &str) -> u32 {
        let count = self.cache.end_session(video_id);
        debug!(video_id, count, "Session unregistered");
        count
    }

    /// Bind a player to the video, returning the binding it replaced.
    pub fn bind(&self, video_id: &str, player: PlayerHandle) -> Option<PlayerHandle> {
        self.bindings().insert(video_id.to_string(), player)
    }

    pub fn unbind(&self, video_id: &str) -> Option<PlayerHandle> {
        self.bindings().remove(video_id)
    }

    pub fn player(&self, video_id: &str) -> Option<PlayerHandle> {
        self.bindings().get(video_id).cloned()
    }

    /// Whether `player` is the binding currently held for the video.
    pub fn is_bound(&self, video_id: &str, player: &PlayerHandle) -> bool {
        self.bindings()
            .get(video_id)
            .is_some_and(|bound| bound.same_binding(player))
    }

    /// Bound video ids, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bindings().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.bindings().clear();
    }
}
