//! Tally Types - Pure type definitions for the survey response store
//!
//! This crate contains only plain data types with no async runtime
//! dependencies: the survey payload, the storage envelope used by the fast
//! tier, sync queue items, and the result shapes returned to the serving
//! layer.

pub mod item;
pub mod query;
pub mod response;
pub mod sync;
pub mod value;

pub use item::*;
pub use query::*;
pub use response::*;
pub use sync::*;
pub use value::*;
