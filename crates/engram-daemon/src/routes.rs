//! HTTP routes
//!
//! Thin JSON mapping from the operation surface onto axum. Handlers push
//! store/embedding work onto the blocking pool and translate every
//! [`ServiceError`] into one status code plus a `{error, message}` body.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use engram_core::{
    MemoryService, RememberRequest, RestoreItem, ServiceError, SettingsDoc, SortOrder,
};

type App = Arc<MemoryService>;

/// Build the daemon router
pub fn router(service: App) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/memories", post(remember).get(list_memories))
        .route("/v1/memories/{id}", delete(forget))
        .route(
            "/v1/memories/{id}/contradictions/{target_id}/resolve",
            post(resolve_contradiction),
        )
        .route("/v1/recall", post(recall))
        .route("/v1/agents/{agent_id}/memories", delete(clear))
        .route("/v1/agents/{agent_id}/purge", post(purge))
        .route("/v1/agents/{agent_id}/restore", post(restore))
        .route("/v1/agents/{agent_id}/export", get(export))
        .route("/v1/agents/{agent_id}/timeline", get(timeline))
        .route("/v1/agents/{agent_id}/wordcloud", get(wordcloud))
        .route("/v1/agents/{agent_id}/projection", get(projection))
        .route("/v1/graph/pending", get(list_pending_edges))
        .route("/v1/graph/pending/approve-batch", post(approve_batch))
        .route("/v1/graph/pending/{id}/approve", post(approve_edge))
        .route("/v1/graph/pending/{id}/reject", post(reject_edge))
        .route("/v1/graph/edges", post(create_edge))
        .route("/v1/graph/nodes/{id}", get(get_node))
        .route("/v1/graph/traverse/{id}", get(traverse))
        .route("/v1/reflect", post(trigger_reflect))
        .route("/v1/reflect/jobs", get(list_jobs))
        .route("/v1/reflect/jobs/{id}", get(get_job))
        .route("/v1/reflect/jobs/{id}/cancel", post(cancel_job))
        .route(
            "/v1/settings/{agent_id}",
            get(get_settings).put(put_settings).delete(delete_settings),
        )
        .route("/v1/settings/{agent_id}/effective", get(effective_settings))
        .route("/v1/usage/totals", get(usage_totals))
        .route("/v1/usage/summary", get(usage_summary))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a service call on the blocking pool
async fn run<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(Json(value)),
        Ok(Err(e)) => Err(ApiError(e)),
        Err(e) => Err(ApiError(ServiceError::Internal(format!(
            "worker panicked: {}",
            e
        )))),
    }
}

fn split_csv(s: Option<String>) -> Vec<String> {
    s.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": engram_core::VERSION }))
}

async fn remember(
    State(service): State<App>,
    Json(request): Json<RememberRequest>,
) -> ApiResult<engram_core::RememberResponse> {
    run(move || service.remember(&request)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    agent_id: String,
    cursor: Option<String>,
    sort: Option<String>,
    limit: Option<usize>,
    tags: Option<String>,
}

async fn list_memories(
    State(service): State<App>,
    Query(query): Query<ListQuery>,
) -> ApiResult<engram_core::api::ListMemoriesResponse> {
    run(move || {
        let sort = match query.sort.as_deref() {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        };
        service.list_memories(
            &query.agent_id,
            query.cursor.as_deref(),
            sort,
            query.limit.unwrap_or(50),
            &split_csv(query.tags),
        )
    })
    .await
}

async fn forget(
    State(service): State<App>,
    Path(id): Path<String>,
) -> ApiResult<engram_core::api::DeletedResponse> {
    run(move || service.forget(&id)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecallBody {
    agent_id: String,
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    tags: Vec<String>,
    project_id: Option<String>,
    min_score: Option<f32>,
}

async fn recall(
    State(service): State<App>,
    Json(body): Json<RecallBody>,
) -> ApiResult<engram_core::RecallResults> {
    run(move || {
        service.recall(
            &body.agent_id,
            &body.query,
            body.limit.unwrap_or(10),
            &body.tags,
            body.project_id.as_deref(),
            body.min_score,
        )
    })
    .await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    resolution: engram_core::ContradictionResolution,
    note: Option<String>,
}

async fn resolve_contradiction(
    State(service): State<App>,
    Path((id, target_id)): Path<(String, String)>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<serde_json::Value> {
    run(move || {
        service.resolve_contradiction(&id, &target_id, body.resolution, body.note)?;
        Ok(json!({ "resolved": [id, target_id] }))
    })
    .await
}

async fn clear(
    State(service): State<App>,
    Path(agent_id): Path<String>,
) -> ApiResult<engram_core::api::DeletedResponse> {
    run(move || service.clear(&agent_id)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurgeBody {
    older_than: DateTime<Utc>,
}

async fn purge(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Json(body): Json<PurgeBody>,
) -> ApiResult<engram_core::api::DeletedResponse> {
    run(move || service.purge(&agent_id, body.older_than)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBody {
    project_id: Option<String>,
    memories: Vec<RestoreItem>,
}

async fn restore(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> ApiResult<engram_core::RestoreResponse> {
    run(move || service.restore(&agent_id, body.project_id.as_deref(), &body.memories)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportQuery {
    project_id: Option<String>,
}

async fn export(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<engram_core::api::ExportResponse> {
    run(move || service.export(&agent_id, query.project_id.as_deref())).await
}

#[derive(Deserialize)]
struct TimelineQuery {
    days: Option<i64>,
}

async fn timeline(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<engram_core::api::TimelineResponse> {
    run(move || service.timeline(&agent_id, query.days.unwrap_or(30))).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WordcloudQuery {
    limit: Option<usize>,
    min_count: Option<u64>,
}

async fn wordcloud(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Query(query): Query<WordcloudQuery>,
) -> ApiResult<engram_core::api::WordcloudResponse> {
    run(move || {
        service.wordcloud(
            &agent_id,
            query.limit.unwrap_or(100),
            query.min_count.unwrap_or(1),
        )
    })
    .await
}

#[derive(Deserialize)]
struct ProjectionQuery {
    limit: Option<usize>,
    dimensions: Option<usize>,
}

async fn projection(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Query(query): Query<ProjectionQuery>,
) -> ApiResult<engram_core::api::ProjectionResponse> {
    run(move || {
        service.embeddings_projection(
            &agent_id,
            query.limit.unwrap_or(200),
            query.dimensions.unwrap_or(2),
        )
    })
    .await
}

// ---- graph ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingQuery {
    #[serde(rename = "type")]
    edge_type: Option<String>,
    min_probability: Option<f64>,
    limit: Option<usize>,
}

async fn list_pending_edges(
    State(service): State<App>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Vec<engram_core::PendingEdge>> {
    run(move || {
        service.list_pending_edges(
            query.edge_type.as_deref(),
            query.min_probability,
            query.limit.unwrap_or(50),
        )
    })
    .await
}

async fn approve_edge(
    State(service): State<App>,
    Path(id): Path<String>,
) -> ApiResult<engram_core::GraphEdge> {
    run(move || service.approve_pending_edge(&id)).await
}

async fn reject_edge(
    State(service): State<App>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(move || {
        service.reject_pending_edge(&id)?;
        Ok(json!({ "rejected": id }))
    })
    .await
}

#[derive(Deserialize)]
struct BatchBody {
    ids: Vec<String>,
}

async fn approve_batch(
    State(service): State<App>,
    Json(body): Json<BatchBody>,
) -> ApiResult<engram_core::graph::BatchOutcome> {
    run(move || Ok(service.approve_batch(&body.ids))).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEdgeBody {
    source_id: String,
    target_id: String,
    #[serde(rename = "type")]
    edge_type: String,
    weight: f64,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

async fn create_edge(
    State(service): State<App>,
    Json(body): Json<CreateEdgeBody>,
) -> ApiResult<engram_core::GraphEdge> {
    run(move || {
        service.create_edge(
            &body.source_id,
            &body.target_id,
            &body.edge_type,
            body.weight,
            body.metadata,
        )
    })
    .await
}

async fn get_node(
    State(service): State<App>,
    Path(id): Path<String>,
) -> ApiResult<engram_core::Memory> {
    run(move || service.get_node(&id)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraverseQuery {
    direction: Option<String>,
    max_depth: Option<usize>,
    edge_types: Option<String>,
}

async fn traverse(
    State(service): State<App>,
    Path(id): Path<String>,
    Query(query): Query<TraverseQuery>,
) -> ApiResult<engram_core::Traversal> {
    run(move || {
        service.traverse(
            &id,
            query.direction.as_deref().unwrap_or("outbound"),
            query.max_depth.unwrap_or(2),
            &split_csv(query.edge_types),
        )
    })
    .await
}

// ---- reflection ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReflectBody {
    agent_id: String,
    session_id: Option<String>,
    session_transcript: Option<String>,
}

async fn trigger_reflect(
    State(service): State<App>,
    Json(body): Json<ReflectBody>,
) -> ApiResult<engram_core::api::TriggerReflectResponse> {
    run(move || {
        service.trigger_reflect(
            &body.agent_id,
            body.session_id.as_deref(),
            body.session_transcript.as_deref(),
        )
    })
    .await
}

async fn get_job(
    State(service): State<App>,
    Path(id): Path<String>,
) -> ApiResult<engram_core::ReflectJob> {
    run(move || service.get_job(&id)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobsQuery {
    agent_id: String,
    limit: Option<usize>,
}

async fn list_jobs(
    State(service): State<App>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Vec<engram_core::ReflectJob>> {
    run(move || service.list_jobs(&query.agent_id, query.limit.unwrap_or(20))).await
}

async fn cancel_job(
    State(service): State<App>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(move || {
        service.cancel_job(&id)?;
        Ok(json!({ "cancelled": id }))
    })
    .await
}

// ---- settings & usage ----

async fn get_settings(
    State(service): State<App>,
    Path(agent_id): Path<String>,
) -> ApiResult<SettingsDoc> {
    run(move || service.get_settings(&agent_id)).await
}

async fn put_settings(
    State(service): State<App>,
    Path(agent_id): Path<String>,
    Json(mut doc): Json<SettingsDoc>,
) -> ApiResult<SettingsDoc> {
    run(move || {
        doc.agent_id = agent_id;
        doc.updated_at = Some(Utc::now());
        service.upsert_settings(&doc)?;
        Ok(doc)
    })
    .await
}

async fn delete_settings(
    State(service): State<App>,
    Path(agent_id): Path<String>,
) -> ApiResult<engram_core::api::DeletedResponse> {
    run(move || service.delete_settings(&agent_id)).await
}

async fn effective_settings(
    State(service): State<App>,
    Path(agent_id): Path<String>,
) -> ApiResult<engram_core::ResolvedPipelineSettings> {
    run(move || service.effective_settings(&agent_id)).await
}

async fn usage_totals(State(service): State<App>) -> ApiResult<serde_json::Value> {
    run(move || Ok(json!(service.usage_totals()))).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageQuery {
    group_by: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

async fn usage_summary(
    State(service): State<App>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Vec<engram_core::UsageBucket>> {
    run(move || {
        service.usage_summary(
            query.since,
            query.until,
            query.group_by.as_deref().unwrap_or("operation"),
        )
    })
    .await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::{DaemonDefaults, EmbeddingClient, MemoryStore};
    use tempfile::TempDir;

    fn app() -> (App, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(Some(dir.path().join("test.db"))).unwrap());
        let embedder = Arc::new(EmbeddingClient::mock());
        let service =
            Arc::new(MemoryService::new(store, embedder, DaemonDefaults::default()).unwrap());
        (service, dir)
    }

    #[test]
    fn test_router_builds() {
        let (service, _dir) = app();
        let _router = router(service);
    }

    #[test]
    fn test_error_mapping_statuses() {
        let bad = ApiError(ServiceError::Validation("nope".into())).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let missing = ApiError(ServiceError::NotFound("gone".into())).into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let down = ApiError(ServiceError::Unavailable("later".into())).into_response();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_split_csv() {
        assert_eq!(split_csv(None), Vec::<String>::new());
        assert_eq!(split_csv(Some("a, b,,c".into())), vec!["a", "b", "c"]);
    }
}
