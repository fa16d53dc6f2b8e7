//! Collaborator implementations that live entirely in process

pub mod memory;

pub use memory::{MemoryRelationalStore, MemorySyncQueue};
