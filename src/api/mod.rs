//! HTTP API over the pipeline.
//!
//! Query failures are data: `/api/query` answers 200 with `success: false`
//! and the trace. Non-2xx codes are reserved for malformed requests and
//! unknown resources.

use crate::db::DatabaseProfile;
use crate::error::Text2SqlError;
use crate::pipeline::{QueryResponse, Text2SqlPipeline};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub type AppState = Arc<Text2SqlPipeline>;

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn default_execute() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(alias = "question")]
    pub query: String,
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub llm_config_id: Option<String>,
    #[serde(default = "default_execute")]
    pub execute: bool,
}

#[derive(Debug, Deserialize)]
pub struct RepairRequest {
    #[serde(alias = "question")]
    pub query: String,
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub llm_config_id: Option<String>,
    pub previous_sql: String,
    pub error_message: String,
    #[serde(default = "default_execute")]
    pub execute: bool,
}

#[derive(Debug, Serialize)]
struct DatabaseInfo {
    #[serde(flatten)]
    profile: DatabaseProfile,
    indexed: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    id: Uuid,
    created_at: DateTime<Utc>,
    question: String,
    database_id: String,
    llm_config_id: Option<String>,
    sql: Option<String>,
    success: bool,
    error: Option<String>,
}

pub fn router(pipeline: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/query", post(query))
        .route("/api/query/repair", post(repair))
        .route("/api/databases", get(databases))
        .route("/api/databases/:id/index", post(index_database))
        .route("/api/llms", get(llms))
        .route("/api/queries/history", get(history))
        .route("/api/queries/:id", get(query_trace))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "text2sql-rag",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(pipeline): State<AppState>) -> Json<Value> {
    Json(json!(pipeline.status()))
}

async fn query(
    State(pipeline): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "query must not be empty"));
    }
    let database_id = resolve_database(&pipeline, request.database_id.as_deref())?;
    let response = pipeline
        .process_query(&request.query, &database_id, request.llm_config_id.as_deref(), request.execute)
        .await;
    Ok(Json(response))
}

async fn repair(
    State(pipeline): State<AppState>,
    Json(request): Json<RepairRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if request.query.trim().is_empty() || request.previous_sql.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "query and previous_sql must not be empty"));
    }
    let database_id = resolve_database(&pipeline, request.database_id.as_deref())?;
    let response = pipeline
        .repair_query(
            &request.query,
            &database_id,
            request.llm_config_id.as_deref(),
            &request.previous_sql,
            &request.error_message,
            request.execute,
        )
        .await;
    Ok(Json(response))
}

async fn databases(State(pipeline): State<AppState>) -> Json<Value> {
    let index = pipeline.retrieval().index();
    let databases: Vec<DatabaseInfo> = pipeline
        .databases()
        .iter()
        .map(|profile| DatabaseInfo {
            indexed: index.contains(&profile.id),
            profile: profile.clone(),
        })
        .collect();
    Json(json!({
        "default": pipeline.default_database_id(),
        "databases": databases,
    }))
}

async fn index_database(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tables = pipeline
        .index_database(&id)
        .await
        .map_err(|e| error(status_for(&e), e.to_string()))?;
    Ok(Json(json!({
        "database_id": id,
        "tables": tables,
        "embedding_model": pipeline.retrieval().model_id(),
    })))
}

async fn llms(State(pipeline): State<AppState>) -> Json<Value> {
    Json(json!({
        "default": pipeline.default_llm(),
        "llms": pipeline.llm_profiles(),
    }))
}

async fn history(State(pipeline): State<AppState>, Query(params): Query<HistoryParams>) -> Json<Value> {
    let entries: Vec<HistoryEntry> = pipeline
        .traces()
        .recent(params.limit.unwrap_or(20))
        .into_iter()
        .map(|trace| HistoryEntry {
            id: trace.id,
            created_at: trace.created_at,
            sql: trace.extracted_sql().map(str::to_string),
            success: trace.errors.is_empty(),
            error: trace.errors.first().cloned(),
            question: trace.question,
            database_id: trace.database_id,
            llm_config_id: trace.llm_config_id,
        })
        .collect();
    Json(json!({ "queries": entries }))
}

async fn query_trace(State(pipeline): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| error(StatusCode::BAD_REQUEST, format!("invalid query id '{}'", id)))?;
    match pipeline.traces().get(&id) {
        Some(trace) => Ok(Json(json!(trace))),
        None => Err(error(StatusCode::NOT_FOUND, format!("query '{}' not found", id))),
    }
}

/// Missing id means the first configured database.
fn resolve_database(pipeline: &Text2SqlPipeline, requested: Option<&str>) -> Result<String, ApiError> {
    let id = match requested.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => pipeline
            .default_database_id()
            .ok_or_else(|| error(StatusCode::BAD_REQUEST, "no database configured"))?,
    };
    pipeline
        .registry()
        .profile(id)
        .map(|p| p.id.clone())
        .map_err(|e| error(status_for(&e), e.to_string()))
}

fn status_for(err: &Text2SqlError) -> StatusCode {
    match err {
        Text2SqlError::DatabaseNotFound(_) | Text2SqlError::LlmConfigNotFound(_) => StatusCode::NOT_FOUND,
        Text2SqlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Text2SqlError::Embedding(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: message.into() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseKind, DatabaseRegistry};
    use crate::llm::{BackoffPolicy, InMemoryLlmConfigStore, LlmGateway, LlmProfile, MockProvider};
    use crate::schema_rag::{HashingEmbedder, ModelStatus, RetrievalEngine, SchemaIndex};
    use axum::body::Body;
    use axum::http::Request;
    use rusqlite::Connection;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(mock: MockProvider) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
                 INSERT INTO users (email) VALUES ('a@example.com'), ('b@example.com');",
            )
            .unwrap();
        let registry = DatabaseRegistry::new(vec![DatabaseProfile::new(
            "shop",
            DatabaseKind::Sqlite,
            path.to_str().unwrap(),
        )]);
        let gateway = LlmGateway::new(BackoffPolicy::default(), Duration::from_secs(5));
        gateway.register("local", Arc::new(mock));
        let pipeline = Text2SqlPipeline::new(
            Arc::new(registry),
            RetrievalEngine::new(SchemaIndex::new(), Arc::new(HashingEmbedder::default()), ModelStatus::ready()),
            Arc::new(InMemoryLlmConfigStore::new(vec![LlmProfile::local()])),
            Arc::new(gateway),
        );
        (dir, router(Arc::new(pipeline)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app(MockProvider::new());
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_query_defaults_to_first_database() {
        let (_dir, app) = app(MockProvider::answering("Count rows.", "SELECT COUNT(*) AS n FROM users"));
        let (status, body) = send(&app, "POST", "/api/query", Some(json!({"query": "how many users?"}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["database_id"], "shop");
        assert_eq!(body["sql"], "SELECT COUNT(*) AS n FROM users");
        assert_eq!(body["result"]["status"], "success");
        assert_eq!(body["result"]["rows"][0][0], 2);
        assert_eq!(body["trace"]["retrieval"][0]["entry"]["name"], "users");
    }

    #[tokio::test]
    async fn test_blocked_query_is_a_successful_http_response() {
        let (_dir, app) = app(MockProvider::answering("Clean up.", "DROP TABLE users;"));
        let (status, body) = send(&app, "POST", "/api/query", Some(json!({"question": "drop users"}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["result"]["status"], "blocked");
        assert!(body["error"].as_str().unwrap().starts_with("query blocked:"));
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (_dir, app) = app(MockProvider::new());
        let (status, _) = send(&app, "POST", "/api/query", Some(json!({"query": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            "/api/query",
            Some(json!({"query": "x", "database_id": "warehouse"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "database 'warehouse' is not configured");

        let (status, _) = send(&app, "GET", "/api/queries/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_and_trace_lookup() {
        let (_dir, app) = app(MockProvider::new());
        send(&app, "POST", "/api/query", Some(json!({"query": "list users", "execute": false}))).await;

        let (status, body) = send(&app, "GET", "/api/queries/history?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["queries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["question"], "list users");

        let id = entries[0]["id"].as_str().unwrap();
        let (status, trace) = send(&app, "GET", &format!("/api/queries/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(trace["question"], "list users");

        let (status, _) = send(&app, "GET", &format!("/api/queries/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_index_and_list_databases() {
        let (_dir, app) = app(MockProvider::new());
        let (_, before) = send(&app, "GET", "/api/databases", None).await;
        assert_eq!(before["databases"][0]["indexed"], false);
        assert!(before["databases"][0].get("url").is_none());

        let (status, body) = send(&app, "POST", "/api/databases/shop/index", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tables"], 1);

        let (_, after) = send(&app, "GET", "/api/databases", None).await;
        assert_eq!(after["default"], "shop");
        assert_eq!(after["databases"][0]["indexed"], true);

        let (status, _) = send(&app, "POST", "/api/databases/nope/index", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_llm_listing_hides_keys() {
        let (_dir, app) = app(MockProvider::new());
        let (status, body) = send(&app, "GET", "/api/llms", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["llms"][0]["id"], "local");
        assert!(body["llms"][0].get("api_key").is_none());
    }
}
