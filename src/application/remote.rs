use super::cache::{PendingCommit, PositionCache};
use crate::ports::remote::RemotePositionStore;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Keeps the cache and the remote position service in step.
///
/// The cache stays the ordering authority: fetched values only fill ids the
/// cache knows nothing about, and acknowledgements only move bookkeeping.
#[derive(Clone)]
pub struct RemoteSync {
    remote: Arc<dyn RemotePositionStore>,
    cache: Arc<PositionCache>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl RemoteSync {
    pub fn new(remote: Arc<dyn RemotePositionStore>, cache: Arc<PositionCache>) -> Self {
        Self {
            remote,
            cache,
            in_flight: Arc::default(),
        }
    }

    /// Fill an unknown id from the remote store, then read the cache.
    pub async fn hydrate(&self, video_id: &str) -> f64 {
        if let Some(token) = self.cache.remote_token(video_id) {
            match self.remote.fetch_position(video_id).await {
                Ok(position) => {
                    if self.cache.apply_remote(video_id, position, token) {
                        debug!(video_id, position, "Hydrated position from remote");
                    }
                }
                Err(e) => warn!(video_id, error = %e, "Remote fetch failed, using cached position"),
            }
        }
        self.cache.get(video_id)
    }

    fn claim(&self, video_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(video_id.to_string())
    }

    fn release(&self, video_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(video_id);
    }

    async fn commit(&self, commit: PendingCommit) -> bool {
        let result = self
            .remote
            .commit_position(&commit.video_id, commit.position)
            .await;
        self.release(&commit.video_id);
        match result {
            Ok(()) => {
                self.cache.acknowledge_commit(&commit);
                true
            }
            Err(e) => {
                warn!(video_id = %commit.video_id, error = %e, "Remote commit dropped");
                false
            }
        }
    }

    /// Commit every unacknowledged record, one request in flight per id.
    /// Ids already in flight are picked up by a later call.
    pub async fn commit_pending(&self) -> usize {
        let commits: Vec<PendingCommit> = self
            .cache
            .pending_commits()
            .into_iter()
            .filter(|commit| self.claim(&commit.video_id))
            .collect();
        if commits.is_empty() {
            return 0;
        }

        let results = join_all(commits.into_iter().map(|commit| self.commit(commit))).await;
        results.into_iter().filter(|acked| *acked).count()
    }

    /// Fire-and-forget `commit_pending`.
    pub fn spawn_commit(&self) {
        match Handle::try_current() {
            Ok(runtime) => {
                let sync = self.clone();
                runtime.spawn(async move {
                    sync.commit_pending().await;
                });
            }
            Err(_) => debug!("No async runtime, remote commit deferred"),
        }
    }
}
