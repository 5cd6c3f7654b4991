//! Session repository implementations.

pub mod memory;

pub use memory::MemoryRepository;
