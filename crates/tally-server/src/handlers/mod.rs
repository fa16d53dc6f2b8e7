//! HTTP handlers

pub mod health;
pub mod responses;

use crate::AppState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tally_core::TallyError;

/// Error response: `{ "error": ..., "code": ... }`
#[derive(Debug)]
pub struct ApiError(pub TallyError);

impl From<TallyError> for ApiError {
    fn from(e: TallyError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TallyError::NotFound(_) => StatusCode::NOT_FOUND,
            TallyError::Validation(_) => StatusCode::BAD_REQUEST,
            TallyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            TallyError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TallyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "code": self.0.code()
        }));
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/responses", post(responses::create))
        .route("/clients/:client_id/responses", get(responses::list))
        .route(
            "/clients/:client_id/responses/:id",
            get(responses::get)
                .patch(responses::update)
                .delete(responses::delete),
        )
        .route(
            "/clients/:client_id/responses/:id/consistency",
            get(responses::consistency),
        )
        .route("/clients/:client_id/responses/:id/sync", post(responses::sync))
        .route("/cache/metrics", get(health::metrics))
}
