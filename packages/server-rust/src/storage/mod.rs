//! Persistence adapters implementing [`crate::traits::EntityStore`].

pub mod memory;

pub use memory::MemoryEntityStore;
