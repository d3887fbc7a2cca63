//! Domain layer - Pure position bookkeeping.

pub mod player;
pub mod position;
