use super::cache::PositionCache;
use super::remote::RemoteSync;
use crate::ports::player::PlayerHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ActiveLoop {
    ticket: u64,
    player: PlayerHandle,
    cancel: CancellationToken,
}

type LoopMap = Arc<Mutex<HashMap<String, ActiveLoop>>>;

fn lock(loops: &LoopMap) -> MutexGuard<'_, HashMap<String, ActiveLoop>> {
    loops.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic sampling of bound players into the cache.
///
/// Exactly one loop runs per video; starting a new one cancels the old.
pub struct AutosaveLoop {
    cache: Arc<PositionCache>,
    interval: Duration,
    remote: Option<RemoteSync>,
    loops: LoopMap,
    next_ticket: AtomicU64,
}

impl AutosaveLoop {
    pub fn new(cache: Arc<PositionCache>, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            remote: None,
            loops: Arc::default(),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Push every tick's flush on to the remote store as well. Only loops
    /// started afterwards pick it up.
    pub fn attach_remote(&mut self, remote: RemoteSync) {
        self.remote = Some(remote);
    }

    pub fn start(&self, video_id: &str, player: PlayerHandle) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(video_id, "No async runtime, autosave not started");
            return;
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = lock(&self.loops).insert(
            video_id.to_string(),
            ActiveLoop {
                ticket,
                player: player.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(video_id, "Replacing autosave loop");
            previous.cancel.cancel();
        }

        let loops = self.loops.clone();
        let cache = self.cache.clone();
        let remote = self.remote.clone();
        let period = self.interval;
        let video_id = video_id.to_string();

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !player.is_alive() {
                    debug!(video_id = %video_id, "Player destroyed, stopping autosave");
                    break;
                }
                let time = match player.current_time() {
                    Ok(time) => time,
                    Err(e) => {
                        debug!(video_id = %video_id, error = %e, "Skipping autosave tick");
                        continue;
                    }
                };
                {
                    // A stop or clear that already ran owns the cache from here on
                    let loops = lock(&loops);
                    if loops.get(&video_id).map(|active| active.ticket) != Some(ticket) {
                        return;
                    }
                    cache.record_sample(&video_id, time);
                }

                let flushing = cache.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || flushing.flush()).await {
                    warn!(video_id = %video_id, error = %e, "Autosave flush task failed");
                    continue;
                }
                if let Some(remote) = &remote {
                    remote.spawn_commit();
                }
            }

            let mut loops = lock(&loops);
            if loops.get(&video_id).map(|active| active.ticket) == Some(ticket) {
                loops.remove(&video_id);
            }
        });
    }

    pub fn stop(&self, video_id: &str) -> bool {
        match lock(&self.loops).remove(video_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (_, active) in lock(&self.loops).drain() {
            active.cancel.cancel();
        }
    }

    pub fn is_running(&self, video_id: &str) -> bool {
        lock(&self.loops).contains_key(video_id)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.loops).len()
    }

    /// Players currently sampled, for a last save on shutdown.
    pub fn players(&self) -> Vec<(String, PlayerHandle)> {
        lock(&self.loops)
            .iter()
            .map(|(video_id, active)| (video_id.clone(), active.player.clone()))
            .collect()
    }
}

impl Drop for AutosaveLoop {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Rate limit for saves triggered by player notifications.
pub struct SaveThrottle {
    min_spacing: Duration,
    last_save: Mutex<HashMap<String, Instant>>,
}

impl SaveThrottle {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_save: Mutex::default(),
        }
    }

    /// True, and the window restarts, when no save happened for
    /// `video_id` within the spacing.
    pub fn try_acquire(&self, video_id: &str) -> bool {
        let now = Instant::now();
        let mut last_save = self.last_save.lock().unwrap_or_else(PoisonError::into_inner);
        match last_save.get(video_id) {
            Some(last) if now.duration_since(*last) < self.min_spacing => false,
            _ => {
                last_save.insert(video_id.to_string(), now);
                true
            }
        }
    }

    pub fn clear(&self) {
        self.last_save
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
