//! Application layer - The position engine and the services it composes.

pub mod autosave;
pub mod binding;
pub mod cache;
pub mod engine;
pub mod registry;
pub mod remote;
pub mod store;
pub mod verification;

pub use binding::PlayerBinding;
pub use engine::PositionEngine;
