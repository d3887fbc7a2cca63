//! Position Server Binary - Remote position store over HTTP
//!
//! Serves `GET`/`POST /api/video-position/:video_id` from memory, for
//! engines configured with `POSITION_REMOTE_URL`.

use tower_http::cors::{Any, CorsLayer};
use video_position::adapters::http::PositionServer;
use video_position::config::ServerConfig;

#[tokio::main]
async fn main() {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt::init();

    let server = PositionServer::new();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = server.router().layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    tracing::info!("Listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
