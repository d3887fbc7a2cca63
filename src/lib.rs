//! Video Position - Playback position synchronization engine
//!
//! Hexagonal Architecture:
//! - domain/: Position records, table format, player states
//! - ports/: Trait definitions (storage medium, remote store, media player)
//! - adapters/: Concrete implementations (file and memory media, HTTP client and server)
//! - application/: Cache, store tiers, verification, autosave, sessions, engine
//! - config: Environment configuration
//!
//! A host component acquires a position before its player exists, seeks to
//! it once the player is ready, and lets the autosave loop and verification
//! scheduler keep the cache current until teardown flushes the final time.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

// Re-exports for convenience
pub use application::{PlayerBinding, PositionEngine};
pub use config::{EngineConfig, ServerConfig};
pub use domain::player::PlayerState;
pub use domain::position::PositionRecord;
pub use error::PositionError;
pub use ports::player::{MediaPlayer, PlayerHandle};
