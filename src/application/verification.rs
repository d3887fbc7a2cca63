use super::cache::PositionCache;
use crate::ports::player::PlayerHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one drift check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftOutcome {
    /// Player destroyed or not ready; nothing touched
    Skipped,
    /// Player within tolerance; its time became the baseline
    InSync { observed: f64 },
    /// Player sought back to the cached position
    Corrected { target: f64, baseline: f64 },
}

struct PendingCheck {
    ticket: u64,
    player: PlayerHandle,
    cancel: CancellationToken,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCheck>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingCheck>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot drift checks, at most one outstanding per video.
pub struct VerificationScheduler {
    cache: Arc<PositionCache>,
    delay: Duration,
    drift_threshold: f64,
    pending: PendingMap,
    next_ticket: AtomicU64,
}

impl VerificationScheduler {
    pub fn new(cache: Arc<PositionCache>, delay: Duration, drift_threshold: f64) -> Self {
        Self {
            cache,
            delay,
            drift_threshold,
            pending: Arc::default(),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Arm a check for `video_id`, replacing any check already pending.
    pub fn schedule(&self, video_id: &str, player: PlayerHandle) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(video_id, "No async runtime, verification not scheduled");
            return;
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = lock(&self.pending).insert(
            video_id.to_string(),
            PendingCheck {
                ticket,
                player: player.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(video_id, "Replacing pending verification");
            previous.cancel.cancel();
        }

        let pending = self.pending.clone();
        let cache = self.cache.clone();
        let delay = self.delay;
        let threshold = self.drift_threshold;
        let video_id = video_id.to_string();

        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Held through the check so a concurrent clear waits for it to land
            let mut pending = lock(&pending);
            if pending.get(&video_id).map(|check| check.ticket) != Some(ticket) {
                return;
            }
            pending.remove(&video_id);
            check_drift(&cache, &video_id, &player, threshold);
        });
    }

    /// Cancel the pending check for `video_id`, if any.
    pub fn clear(&self, video_id: &str) -> bool {
        match lock(&self.pending).remove(video_id) {
            Some(check) => {
                check.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the pending check only if it targets `player`.
    pub fn clear_for(&self, video_id: &str, player: &PlayerHandle) -> bool {
        let mut pending = lock(&self.pending);
        let matches = pending
            .get(video_id)
            .is_some_and(|check| check.player.same_binding(player));
        if !matches {
            return false;
        }
        if let Some(check) = pending.remove(video_id) {
            check.cancel.cancel();
        }
        true
    }

    pub fn clear_all(&self) {
        for (_, check) in lock(&self.pending).drain() {
            check.cancel.cancel();
        }
    }

    pub fn is_pending(&self, video_id: &str) -> bool {
        lock(&self.pending).contains_key(video_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for VerificationScheduler {
    fn drop(&mut self) {
        self.clear_all();
    }
}

/// Compare the player's clock to the cached position and correct drift.
pub fn check_drift(
    cache: &PositionCache,
    video_id: &str,
    player: &PlayerHandle,
    threshold: f64,
) -> DriftOutcome {
    let observed = match player.current_time() {
        Ok(time) => time,
        Err(e) => {
            debug!(video_id, error = %e, "Skipping verification");
            return DriftOutcome::Skipped;
        }
    };
    let target = cache.get(video_id);

    if (observed - target).abs() <= threshold {
        cache.record_verified(video_id, observed);
        return DriftOutcome::InSync { observed };
    }

    if let Err(e) = player.seek_to(target, true) {
        debug!(video_id, error = %e, "Skipping drift correction");
        return DriftOutcome::Skipped;
    }
    info!(video_id, observed, target, "Corrected playback drift");

    // Re-read after the seek; a player still reporting the old time keeps the target.
    let baseline = player
        .current_time()
        .ok()
        .filter(|after| (after - target).abs() <= threshold)
        .unwrap_or(target);
    cache.record_verified(video_id, baseline);
    DriftOutcome::Corrected { target, baseline }
}
