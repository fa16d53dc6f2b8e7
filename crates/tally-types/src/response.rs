//! Survey response types

use crate::item::{IndexKey, Indexed};
use crate::value::CustomFields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest score on the 0-10 recommendation scale
pub const MAX_SCORE: u8 = 10;

/// Index name for the grouping (client) id
pub const CLIENT_INDEX: &str = "client";

/// Index name for the review status
pub const STATUS_INDEX: &str = "status";

/// Review status of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Received,
    Reviewed,
    Flagged,
    Archived,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Received => write!(f, "received"),
            ResponseStatus::Reviewed => write!(f, "reviewed"),
            ResponseStatus::Flagged => write!(f, "flagged"),
            ResponseStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for ResponseStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(ResponseStatus::Received),
            "reviewed" => Ok(ResponseStatus::Reviewed),
            "flagged" => Ok(ResponseStatus::Flagged),
            "archived" => Ok(ResponseStatus::Archived),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// Request validation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("score {0} is outside 0..=10")]
    ScoreOutOfRange(u8),

    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

/// A stored survey response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: String,
    pub client_id: String,
    pub survey_id: String,
    pub score: u8,
    pub status: ResponseStatus,
    pub comment: Option<String>,
    #[serde(default)]
    pub custom_fields: CustomFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SurveyResponse {
    /// Build the canonical record for a new submission
    pub fn from_request(request: CreateResponseRequest, id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            client_id: request.client_id,
            survey_id: request.survey_id,
            score: request.score,
            status: ResponseStatus::Received,
            comment: request.comment,
            custom_fields: request.custom_fields,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update, bumping `updated_at`
    pub fn apply(&mut self, patch: &ResponsePatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(score) = patch.score {
            self.score = score;
        }
        if let Some(comment) = &patch.comment {
            self.comment = Some(comment.clone());
        }
        for (name, value) in &patch.custom_fields {
            self.custom_fields.insert(name.clone(), value.clone());
        }
        self.updated_at = now;
    }

    /// Whether the mutable, audited fields agree between two copies
    pub fn same_mutable_fields(&self, other: &SurveyResponse) -> bool {
        self.status == other.status && self.score == other.score
    }
}

/// Listing order: newest first, id as the tie-breaker
pub fn newest_first(a: &SurveyResponse, b: &SurveyResponse) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

impl Indexed for SurveyResponse {
    fn index_keys(&self) -> Vec<IndexKey> {
        vec![
            IndexKey::new(CLIENT_INDEX, self.client_id.clone()),
            IndexKey::new(STATUS_INDEX, self.status.to_string()),
        ]
    }
}

/// Incoming submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponseRequest {
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub client_id: String,
    pub survey_id: String,
    pub score: u8,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub custom_fields: CustomFields,
}

impl CreateResponseRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.client_id.trim().is_empty() {
            return Err(ValidationError::MissingField("client_id"));
        }
        if self.survey_id.trim().is_empty() {
            return Err(ValidationError::MissingField("survey_id"));
        }
        if matches!(&self.id, Some(id) if id.trim().is_empty()) {
            return Err(ValidationError::MissingField("id"));
        }
        if self.score > MAX_SCORE {
            return Err(ValidationError::ScoreOutOfRange(self.score));
        }
        Ok(())
    }
}

/// Partial update of a response's mutable fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsePatch {
    #[serde(default)]
    pub status: Option<ResponseStatus>,
    #[serde(default)]
    pub score: Option<u8>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub custom_fields: CustomFields,
}

impl ResponsePatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.score {
            Some(score) if score > MAX_SCORE => Err(ValidationError::ScoreOutOfRange(score)),
            _ => Ok(()),
        }
    }
}
