use crate::error::PositionError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Minimal capability set consumed from the embedded media player.
#[cfg_attr(test, mockall::automock)]
pub trait MediaPlayer: Send + Sync {
    /// Current playback offset in seconds, `None` while the player is not ready.
    fn current_time(&self) -> Option<f64>;

    fn seek_to(&self, seconds: f64, allow_seek_ahead: bool);
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Owned binding to a live player.
///
/// Every scheduled callback goes through the handle, which refuses to touch
/// the player once `destroy` has been called.
#[derive(Clone)]
pub struct PlayerHandle {
    id: u64,
    player: Arc<dyn MediaPlayer>,
    alive: Arc<AtomicBool>,
}

impl PlayerHandle {
    pub fn new(player: Arc<dyn MediaPlayer>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            player,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the player as destroyed. Clones observe it too.
    pub fn destroy(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Whether both handles refer to the same player binding.
    pub fn same_binding(&self, other: &PlayerHandle) -> bool {
        self.id == other.id
    }

    pub fn current_time(&self) -> Result<f64, PositionError> {
        if !self.is_alive() {
            return Err(PositionError::PlayerUnavailable(format!(
                "player {} destroyed",
                self.id
            )));
        }
        self.player
            .current_time()
            .filter(|t| t.is_finite())
            .ok_or_else(|| PositionError::PlayerUnavailable(format!("player {} not ready", self.id)))
    }

    pub fn seek_to(&self, seconds: f64, allow_seek_ahead: bool) -> Result<(), PositionError> {
        if !self.is_alive() {
            return Err(PositionError::PlayerUnavailable(format!(
                "player {} destroyed",
                self.id
            )));
        }
        self.player.seek_to(seconds, allow_seek_ahead);
        Ok(())
    }
}

impl fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
