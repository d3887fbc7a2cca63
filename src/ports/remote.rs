use crate::error::PositionError;
use async_trait::async_trait;

/// Remote position service.
///
/// Calls may take arbitrarily long and complete in any order; callers treat
/// every error as "no known position" or a dropped write.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemotePositionStore: Send + Sync {
    /// Fetch the stored position for a video (0 when the service knows none)
    async fn fetch_position(&self, video_id: &str) -> Result<f64, PositionError>;

    /// Commit a position; `Ok` is the service's acknowledgement
    async fn commit_position(&self, video_id: &str, position: f64) -> Result<(), PositionError>;
}
