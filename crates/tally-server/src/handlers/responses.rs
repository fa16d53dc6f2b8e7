//! Survey response handlers

use super::ApiError;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tally_core::{
    CreateResponseRequest, ForceSyncOutcome, MergedQueryResult, ResponsePatch, SurveyResponse,
    TallyError, UpdateOutcome, Version, WriteReceipt,
};

const DEFAULT_TAKE: usize = 20;
const MAX_TAKE: usize = 100;

pub async fn create(
    State(state): State<AppState>,
    Json(req_body): Json<CreateResponseRequest>,
) -> Result<(StatusCode, Json<WriteReceipt>), ApiError> {
    if !state.rate_limiter.check(&req_body.client_id) {
        return Err(TallyError::RateLimited(req_body.client_id).into());
    }

    let receipt = state.orchestrator.process_write(req_body).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    skip: Option<usize>,
    take: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<MergedQueryResult<SurveyResponse>>, ApiError> {
    let skip = params.skip.unwrap_or(0);
    let take = params.take.unwrap_or(DEFAULT_TAKE).clamp(1, MAX_TAKE);

    let result = state.orchestrator.list(&client_id, skip, take).await?;
    Ok(Json(result))
}

pub async fn get(
    State(state): State<AppState>,
    Path((client_id, id)): Path<(String, String)>,
) -> Result<Json<SurveyResponse>, ApiError> {
    match state.orchestrator.get(&id, &client_id).await? {
        Some(response) => Ok(Json(response)),
        None => Err(TallyError::NotFound(format!("response {}", id)).into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(flatten)]
    patch: ResponsePatch,
    expected_version: Option<Version>,
}

/// 200 with the new version, or 409 with the current one
pub async fn update(
    State(state): State<AppState>,
    Path((client_id, id)): Path<(String, String)>,
    Json(req_body): Json<UpdateRequest>,
) -> Result<(StatusCode, Json<UpdateOutcome>), ApiError> {
    let outcome = state
        .orchestrator
        .update(&id, &client_id, req_body.patch, req_body.expected_version)
        .await?;

    let status = match outcome {
        UpdateOutcome::Updated { .. } => StatusCode::OK,
        UpdateOutcome::Conflict { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((client_id, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.orchestrator.delete(&id, &client_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TallyError::NotFound(format!("response {}", id)).into())
    }
}

#[derive(Debug, Serialize)]
pub struct ConsistencyResponse {
    id: String,
    client_id: String,
    consistent: bool,
}

pub async fn consistency(
    State(state): State<AppState>,
    Path((client_id, id)): Path<(String, String)>,
) -> Result<Json<ConsistencyResponse>, ApiError> {
    let consistent = state.orchestrator.check_consistency(&id, &client_id).await?;
    Ok(Json(ConsistencyResponse {
        id,
        client_id,
        consistent,
    }))
}

pub async fn sync(
    State(state): State<AppState>,
    Path((client_id, id)): Path<(String, String)>,
) -> Result<Json<ForceSyncOutcome>, ApiError> {
    let outcome = state.orchestrator.force_sync(&id, &client_id).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use crate::handlers::router;
    use crate::services::{OrchestratorConfig, RateLimiter, Reconciler, StorageOrchestrator};
    use crate::storage::{FastStore, FastStoreConfig};
    use crate::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tally_core::adapters::{MemoryRelationalStore, MemorySyncQueue};
    use tally_core::ports::{Clock, SystemClock};
    use tower::ServiceExt;

    fn app(max_requests: u32) -> Router {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let fast = Arc::new(FastStore::new(clock.clone(), FastStoreConfig::default()));
        let config = OrchestratorConfig::default();
        let (reconciler, _worker) = Reconciler::new(fast.clone(), config.hot_ttl, 16);
        let orchestrator = StorageOrchestrator::new(
            fast,
            Arc::new(MemoryRelationalStore::new()),
            Arc::new(MemorySyncQueue::new(clock.clone())),
            reconciler,
            clock.clone(),
            config,
        );
        router(AppState {
            orchestrator: Arc::new(orchestrator),
            rate_limiter: Arc::new(RateLimiter::new(
                max_requests,
                chrono::Duration::seconds(60),
                clock,
            )),
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn submission(id: &str) -> Value {
        json!({
            "id": id,
            "client_id": "acme",
            "survey_id": "q3-nps",
            "score": 9,
            "custom_fields": { "channel": "email", "tags": ["a", "b"] }
        })
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let app = app(0);

        let (status, body) = send(&app, "POST", "/api/v1/responses", Some(submission("r1"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["cache_status"], "available");
        assert_eq!(body["durable_status"], "queued");

        let (status, body) = send(&app, "GET", "/api/v1/clients/acme/responses/r1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["score"], 9);
        assert_eq!(body["custom_fields"]["tags"][1], "b");

        let (status, body) = send(&app, "GET", "/api/v1/clients/acme/responses?take=500", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
        assert_eq!(body["metadata"]["take"], 100);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let app = app(1);

        let (status, body) = send(&app, "GET", "/api/v1/clients/acme/responses/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let mut bad = submission("r1");
        bad["score"] = json!(11);
        let (status, body) = send(&app, "POST", "/api/v1/responses", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_failed");

        let (status, body) = send(&app, "POST", "/api/v1/responses", Some(submission("r2"))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "{}", body);
        assert_eq!(body["code"], "rate_limited");
    }

    #[tokio::test]
    async fn test_update_conflict_and_delete() {
        let app = app(0);
        let (_, receipt) = send(&app, "POST", "/api/v1/responses", Some(submission("r1"))).await;
        let version = receipt["version"].as_u64().unwrap();

        let patch = json!({ "status": "flagged", "expected_version": version });
        let (status, body) = send(&app, "PATCH", "/api/v1/clients/acme/responses/r1", Some(patch.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "updated");
        assert_eq!(body["response"]["status"], "flagged");

        let (status, body) = send(&app, "PATCH", "/api/v1/clients/acme/responses/r1", Some(patch)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["outcome"], "conflict");

        let (status, _) = send(&app, "DELETE", "/api/v1/clients/acme/responses/r1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/api/v1/clients/acme/responses/r1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_consistency_sync_and_health() {
        let app = app(0);
        send(&app, "POST", "/api/v1/responses", Some(submission("r1"))).await;

        let (status, body) = send(&app, "GET", "/api/v1/clients/acme/responses/r1/consistency", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["consistent"], false);

        let (status, body) = send(&app, "POST", "/api/v1/clients/acme/responses/r1/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "evicted");

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sync"]["pending"], 1);

        let (status, body) = send(&app, "GET", "/api/v1/cache/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["total_items"].is_number());
    }
}
