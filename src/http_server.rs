// HTTP REST API Server Implementation
// JSON API over the per-project git sync operations

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    error::SyncError,
    git::RepoStatus,
    model::{GitSettingsUpdate, GitSettingsView},
    observability::{get_metrics, SyncMetrics},
    store::ProjectStore,
    sync::{ExportSummary, ImportOptions, ImportSummary, SyncReport, SyncService, SyncStatus},
    types::ValidatedProjectId,
    validation::ValidationError,
};

// Global server start time for uptime tracking
static SERVER_START_TIME: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    service: Arc<SyncService<dyn ProjectStore>>,
}

/// Optional body of the import endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ImportRequest {
    pub delete_missing: Option<bool>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub metrics: SyncMetrics,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create HTTP server with all routes configured
pub fn create_server(service: Arc<SyncService<dyn ProjectStore>>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/projects/:id/git/settings",
            get(get_settings).put(update_settings),
        )
        .route("/api/projects/:id/git/init", post(init_repository))
        .route("/api/projects/:id/git/export", post(export_project))
        .route("/api/projects/:id/git/import", post(import_project))
        .route("/api/projects/:id/git/push", post(push_project))
        .route("/api/projects/:id/git/pull", post(pull_project))
        .route("/api/projects/:id/git/sync", post(sync_project))
        .route("/api/projects/:id/git/status", get(project_status))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the HTTP server on `host:port`
pub async fn start_server(
    service: Arc<SyncService<dyn ProjectStore>>,
    host: &str,
    port: u16,
) -> Result<()> {
    let app = create_server(service);
    let listener = TcpListener::bind(&format!("{host}:{port}")).await?;

    info!("casesync HTTP server listening on {}:{}", host, port);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    let uptime_seconds = SERVER_START_TIME.elapsed().as_secs();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        metrics: get_metrics(),
    })
}

async fn get_settings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<GitSettingsView> {
    let project_id = project_id(id)?;
    state
        .service
        .get_settings(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<GitSettingsUpdate>,
) -> ApiResult<GitSettingsView> {
    let project_id = project_id(id)?;
    state
        .service
        .configure(project_id, update)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn init_repository(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<RepoStatus> {
    let project_id = project_id(id)?;
    state
        .service
        .init(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn export_project(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ExportSummary> {
    let project_id = project_id(id)?;
    state
        .service
        .export(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn import_project(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    request: Option<Json<ImportRequest>>,
) -> ApiResult<ImportSummary> {
    let project_id = project_id(id)?;
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let options = ImportOptions {
        delete_missing: request
            .delete_missing
            .unwrap_or(state.service.config().delete_missing),
    };
    state
        .service
        .import(project_id, options)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn push_project(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncReport> {
    let project_id = project_id(id)?;
    state
        .service
        .push(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn pull_project(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncReport> {
    let project_id = project_id(id)?;
    state
        .service
        .pull(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn sync_project(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncReport> {
    let project_id = project_id(id)?;
    state
        .service
        .sync(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn project_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncStatus> {
    let project_id = project_id(id)?;
    state
        .service
        .status(project_id)
        .await
        .map(Json)
        .map_err(error_response)
}

fn project_id(id: i64) -> Result<i64, ApiError> {
    match ValidatedProjectId::new(id) {
        Ok(id) => Ok(id.get()),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid_project_id".to_string(),
                message: e.to_string(),
            }),
        )),
    }
}

/// Map a service failure onto a status code and `{error, message}` body
fn error_response(err: anyhow::Error) -> ApiError {
    let sync_error = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SyncError>());

    let (status, code) = match sync_error {
        Some(e @ SyncError::ProjectNotFound(_)) => (StatusCode::NOT_FOUND, e.code()),
        Some(e @ SyncError::InvalidSettings(_)) => (StatusCode::BAD_REQUEST, e.code()),
        Some(
            e @ (SyncError::NotConfigured(_)
            | SyncError::SectionCycle(_)
            | SyncError::UnresolvedConflicts(_)
            | SyncError::PushRejected { .. }),
        ) => (StatusCode::CONFLICT, e.code()),
        Some(e @ SyncError::Timeout { .. }) => (StatusCode::GATEWAY_TIMEOUT, e.code()),
        None if err
            .chain()
            .any(|cause| cause.downcast_ref::<ValidationError>().is_some()) =>
        {
            (StatusCode::BAD_REQUEST, "validation_failed")
        }
        None => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status.is_server_error() {
        warn!("Request failed: {:#}", err);
    }

    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: format!("{err:#}"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sync::test_support::seeded_store;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    async fn create_test_server() -> (Router, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = SyncConfig {
            work_dir: temp_dir.path().join("work"),
            attachments_dir: temp_dir.path().join("uploads"),
            ..SyncConfig::default()
        };
        let store: Arc<dyn ProjectStore> = Arc::new(seeded_store(&config.attachments_dir).await);
        let service = Arc::new(SyncService::new(store, config));
        (create_server(service), temp_dir)
    }

    async fn body_json(response: axum::response::Response) -> Result<Value> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn put_settings(project_id: i64, body: Value) -> Result<Request<Body>> {
        Ok(Request::builder()
            .method("PUT")
            .uri(format!("/api/projects/{project_id}/git/settings"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?)
    }

    fn post(path: &str) -> Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::empty())?)
    }

    #[tokio::test]
    async fn test_health_check() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await?;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["metrics"]["steps"].as_u64().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_settings_never_return_token() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app
            .clone()
            .oneshot(put_settings(
                1,
                json!({
                    "remote_url": "https://github.com/acme/qa-data.git",
                    "access_token": "ghp_secret123",
                }),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert!(!String::from_utf8_lossy(&bytes).contains("ghp_secret123"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/1/git/settings")
                    .body(Body::empty())?,
            )
            .await?;
        let body = body_json(response).await?;
        assert_eq!(body["has_access_token"], true);
        assert_eq!(body["branch"], "main");
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_settings_are_bad_request() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app
            .oneshot(put_settings(1, json!({ "branch": "bad branch" }))?)
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await?["error"], "invalid_settings");
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/42/git/status")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await?["error"], "project_not_found");
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_project_id() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app.oneshot(post("/api/projects/0/git/export")?).await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await?["error"], "invalid_project_id");
        Ok(())
    }

    #[tokio::test]
    async fn test_push_without_remote_conflicts() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app.oneshot(post("/api/projects/1/git/push")?).await?;

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await?["error"], "not_configured");
        Ok(())
    }

    #[tokio::test]
    async fn test_export_and_import_endpoints() -> Result<()> {
        let (app, _temp_dir) = create_test_server().await;

        let response = app
            .clone()
            .oneshot(post("/api/projects/1/git/export")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await?;
        assert_eq!(body["counts"]["test_case"], 2);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects/1/git/import")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "delete_missing": false }).to_string()))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await?;
        assert_eq!(body["remapped_ids"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_push_and_status_through_api() -> Result<()> {
        let (app, temp_dir) = create_test_server().await;
        let remote = temp_dir.path().join("remote.git");
        git2::Repository::init_bare(&remote)?;

        let response = app
            .clone()
            .oneshot(put_settings(
                1,
                json!({ "remote_url": remote.to_str().unwrap() }),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post("/api/projects/1/git/push")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await?;
        assert_eq!(report["pushed"], true);
        assert_eq!(report["reconcile"]["kind"], "remote_empty");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/1/git/status")
                    .body(Body::empty())?,
            )
            .await?;
        let status = body_json(response).await?;
        assert_eq!(status["repository"]["head"], report["head"]);
        assert_eq!(status["repository"]["ahead"], 0);
        assert!(status["settings"]["last_sync_at"].is_string());
        Ok(())
    }
}
