//! Port traits (interfaces) for dependency injection

pub mod clock;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::{RelationalStore, SyncQueue};
