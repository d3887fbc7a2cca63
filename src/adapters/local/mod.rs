//! Local storage media.

pub mod fs;
pub mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;
