//! Backend implementations.

pub mod memory;
pub mod redb;

pub use memory::MemoryBackend;
pub use redb::{RedbBackend, RedbBackendConfig};
