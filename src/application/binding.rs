use super::engine::PositionEngine;
use crate::domain::player::PlayerState;
use crate::ports::player::PlayerHandle;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle of one player-hosting component.
///
/// `acquire` before the player exists, `on_ready` once it can seek,
/// `on_state_change` for every notification, `teardown` (or drop) when the
/// host goes away.
pub struct PlayerBinding {
    engine: Arc<PositionEngine>,
    video_id: String,
    start_position: f64,
    player: Option<PlayerHandle>,
    released: bool,
}

impl PlayerBinding {
    /// Open a session and read the position to start from.
    pub fn acquire(engine: Arc<PositionEngine>, video_id: &str) -> Self {
        engine.register_session(video_id);
        let start_position = engine.get_position(video_id);
        Self::opened(engine, video_id, start_position)
    }

    /// Same as `acquire`, consulting the remote store for unknown ids.
    pub async fn acquire_resolved(engine: Arc<PositionEngine>, video_id: &str) -> Self {
        engine.register_session(video_id);
        let start_position = engine.resolve_position(video_id).await;
        Self::opened(engine, video_id, start_position)
    }

    fn opened(engine: Arc<PositionEngine>, video_id: &str, start_position: f64) -> Self {
        debug!(video_id, start_position, "Player binding acquired");
        Self {
            engine,
            video_id: video_id.to_string(),
            start_position,
            player: None,
            released: false,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn start_position(&self) -> f64 {
        self.start_position
    }

    pub fn player(&self) -> Option<&PlayerHandle> {
        self.player.as_ref()
    }

    /// The player is ready: restore the position and start autosaving.
    pub fn on_ready(&mut self, player: PlayerHandle) {
        if self.start_position > 0.0 {
            if let Err(e) = player.seek_to(self.start_position, true) {
                debug!(video_id = %self.video_id, error = %e, "Restore seek skipped");
            }
        }
        if let Some(previous) = self.player.replace(player.clone()) {
            if !previous.same_binding(&player) {
                previous.destroy();
            }
        }
        self.engine.bind_player(&self.video_id, player);
    }

    pub fn on_state_change(&self, state: PlayerState) {
        match &self.player {
            Some(player) => self
                .engine
                .handle_state_change(&self.video_id, player, state),
            None => debug!(video_id = %self.video_id, ?state, "State change before ready"),
        }
    }

    /// Save the final time, close the session, and destroy the player.
    pub fn teardown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let player = self.player.take();
        self.engine.end_session(&self.video_id, player.as_ref());
        if let Some(player) = player {
            player.destroy();
        }
    }
}

impl Drop for PlayerBinding {
    fn drop(&mut self) {
        self.release();
    }
}
