//! Tally Core Library
//!
//! Error taxonomy, collaborator ports and in-memory adapters shared by the
//! storage subsystem.

// Re-export pure types from tally-types
pub use tally_types::*;

pub mod adapters;
pub mod error;
pub mod ports;

pub use error::{Result, TallyError};
