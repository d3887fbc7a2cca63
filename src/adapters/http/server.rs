use super::{CommitAck, PositionBody};
use crate::domain::position::clamp_position;
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory remote position service.
#[derive(Debug, Clone, Default)]
pub struct PositionServer {
    positions: Arc<RwLock<HashMap<String, f64>>>,
}

impl PositionServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/api/video-position/:video_id",
                get(get_position).post(post_position),
            )
            .with_state(self.clone())
    }

    pub async fn position(&self, video_id: &str) -> Option<f64> {
        self.positions.read().await.get(video_id).copied()
    }
}

async fn get_position(
    State(server): State<PositionServer>,
    Path(video_id): Path<String>,
) -> Json<PositionBody> {
    let position = server.position(&video_id).await.unwrap_or(0.0);
    Json(PositionBody { position })
}

async fn post_position(
    State(server): State<PositionServer>,
    Path(video_id): Path<String>,
    Json(body): Json<PositionBody>,
) -> Json<CommitAck> {
    let position = clamp_position(body.position);
    debug!(video_id = %video_id, position, "Storing remote position");
    server.positions.write().await.insert(video_id, position);
    Json(CommitAck { success: true })
}
