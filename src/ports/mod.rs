//! Ports - Trait definitions at the engine's seams.

pub mod player;
pub mod remote;
pub mod storage;
