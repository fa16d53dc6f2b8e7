//! Storage layer
//!
//! `FastStore` is the in-process hot tier (DashMap). `Database` is the
//! SQLite source of truth and durable sync queue.

pub mod db;
pub mod fast_store;

pub use db::Database;
pub use fast_store::{CasResult, FastStore, FastStoreConfig, Lookup, PutOutcome};
