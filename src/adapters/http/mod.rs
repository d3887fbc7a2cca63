//! HTTP adapters for the remote position service.
//!
//! - `server`: axum router holding positions in memory
//! - `client`: reqwest implementation of `RemotePositionStore` against it

pub mod client;
pub mod server;

pub use client::HttpPositionStore;
pub use server::PositionServer;

use serde::{Deserialize, Serialize};

/// Body of `GET` responses and `POST` requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionBody {
    pub position: f64,
}

/// Acknowledgement returned by `POST`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommitAck {
    pub success: bool,
}
