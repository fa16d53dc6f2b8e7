//! Error types for Tally

use tally_types::ValidationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TallyError>;

#[derive(Error, Debug)]
pub enum TallyError {
    /// Absent where presence is required. Plain absence on reads is `Ok(None)`.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Fast store is full ({limit} items)")]
    CapacityExceeded { limit: usize },

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Upstream failure in {store}: {message}")]
    Upstream { store: &'static str, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl TallyError {
    pub fn upstream(store: &'static str, message: impl Into<String>) -> Self {
        TallyError::Upstream {
            store,
            message: message.into(),
        }
    }

    /// Short machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TallyError::NotFound(_) => "not_found",
            TallyError::Validation(_) => "validation_failed",
            TallyError::CapacityExceeded { .. } => "capacity_exceeded",
            TallyError::RateLimited(_) => "rate_limited",
            TallyError::Timeout(_) => "timeout",
            TallyError::Upstream { .. } => "upstream_failure",
            TallyError::Database(_) => "database_error",
            TallyError::Serialization(_) => "serialization_error",
            TallyError::Config(_) => "config_error",
        }
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(e: serde_json::Error) -> Self {
        TallyError::Serialization(e.to_string())
    }
}
