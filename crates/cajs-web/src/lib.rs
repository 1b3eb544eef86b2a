//! Axum JSON API for the carbon-aware scheduler.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use cajs_core::{Job, Task};
use cajs_engine::{CarbonStatus, EngineError, JobOrchestrator, ScheduleOutcome, SchedulerConfig};
use cajs_storage::StoreError;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "cajs-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<JobOrchestrator>,
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            orchestrator,
            cors_origins: Vec::new(),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}

/// Error body shared by every failing route: `{message, error, type}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub error: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>, error: String) -> Self {
        Self {
            status,
            body: ErrorBody {
                message: message.into(),
                error,
                kind,
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let detail = err.to_string();
        match err {
            EngineError::InvalidTask(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                "Invalid task",
                detail,
            ),
            EngineError::Store(StoreError::NotFound(_)) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", "Job not found", detail)
            }
            EngineError::Store(StoreError::Conflict { .. }) => Self::new(
                StatusCode::BAD_REQUEST,
                "conflict",
                "Job cannot be cancelled",
                detail,
            ),
            EngineError::Store(_) => {
                error!(error = %detail, "storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "Job storage failed",
                    detail,
                )
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            rejection.status(),
            "validation_error",
            "Invalid request body",
            rejection.body_text(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    Router::new()
        .route("/", get(index_handler))
        .route("/api/health", get(health_handler))
        .route("/api/schedule", post(schedule_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/clear", delete(clear_jobs_handler))
        .route("/api/jobs/{id}", get(get_job_handler).delete(cancel_job_handler))
        .route("/api/carbon/status", get(carbon_status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// `*` allows any origin; unparseable entries are skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let allowed = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    base.allow_origin(AllowOrigin::list(allowed))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env();
    let orchestrator = JobOrchestrator::from_config(&config).await?;
    let state = AppState::new(Arc::new(orchestrator)).with_cors_origins(config.cors_origins.clone());
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "cajs api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Welcome to the Carbon-Aware Job Scheduler API",
        "health": "/api/health",
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": CRATE_NAME }))
}

async fn schedule_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Task>, JsonRejection>,
) -> Result<Json<ScheduleOutcome>, ApiError> {
    let Json(task) = payload?;
    Ok(Json(state.orchestrator.schedule(task).await?))
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.orchestrator.list_jobs().await?))
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.get_job(id).await?))
}

async fn cancel_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.cancel_job(id).await?))
}

async fn clear_jobs_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.orchestrator.clear_jobs().await?;
    Ok(Json(json!({
        "message": format!("Deleted {deleted} jobs"),
        "deleted": deleted,
    })))
}

async fn carbon_status_handler(State(state): State<Arc<AppState>>) -> Json<CarbonStatus> {
    Json(state.orchestrator.carbon_status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cajs_storage::JobStore;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn orchestrator() -> Arc<JobOrchestrator> {
        Arc::new(JobOrchestrator::offline(JobStore::in_memory().await.unwrap()))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn schedule_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/schedule")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn welcome_and_health_respond() {
        let app = app(AppState::new(orchestrator().await));
        let (status, body) = send(&app, request("GET", "/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("Carbon-Aware"));

        let (status, body) = send(&app, request("GET", "/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn schedule_returns_outcome_and_persists_job() {
        let app = app(AppState::new(orchestrator().await));
        let (status, body) = send(
            &app,
            schedule_request(r#"{"task_name": "Train Model", "duration_hours": 4, "resource_usage": "high"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let job_id = body["job_id"].as_i64().unwrap();
        assert_eq!(body["task"]["task_name"], "Train Model");
        assert_eq!(body["carbon_data"]["location"], cajs_core::SIMULATED_LOCATION);
        assert_eq!(body["carbon_data"]["unit"], "gCO2/kWh");
        assert_eq!(body["recommendation"]["confidence_score"], 0.5);
        assert_eq!(body["recommendation"]["source"], "heuristic");
        assert!(body["insights"].as_str().unwrap().contains("DVFS"));
        assert!(body["analysis"]["carbon_difference"].as_f64().unwrap() > 0.0);
        assert!(body.get("job").is_none());

        let (status, job) = send(&app, request("GET", &format!("/api/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "pending");
        assert_eq!(job["scheduled_time"], body["recommendation"]["recommended_start_time"]);
    }

    #[tokio::test]
    async fn invalid_tasks_are_unprocessable() {
        let app = app(AppState::new(orchestrator().await));
        for payload in [
            r#"{"task_name": "", "duration_hours": 1, "resource_usage": "low"}"#,
            r#"{"task_name": "etl", "duration_hours": -2, "resource_usage": "low"}"#,
            r#"{"task_name": "etl"}"#,
        ] {
            let (status, body) = send(&app, schedule_request(payload)).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{payload}");
            assert_eq!(body["type"], "validation_error");
            assert!(body["message"].is_string() && body["error"].is_string());
        }
        let (_, jobs) = send(&app, request("GET", "/api/jobs")).await;
        assert_eq!(jobs, Value::Array(vec![]));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let app = app(AppState::new(orchestrator().await));
        for method in ["GET", "DELETE"] {
            let (status, body) = send(&app, request(method, "/api/jobs/9999")).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["type"], "not_found");
        }
    }

    #[tokio::test]
    async fn cancel_succeeds_once_then_conflicts() {
        let app = app(AppState::new(orchestrator().await));
        let (_, body) = send(
            &app,
            schedule_request(r#"{"task_name": "Nightly ETL", "duration_hours": 2, "resource_usage": "medium"}"#),
        )
        .await;
        let uri = format!("/api/jobs/{}", body["job_id"]);

        let (status, job) = send(&app, request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "cancelled");

        let (status, body) = send(&app, request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "conflict");

        let (_, job) = send(&app, request("GET", &uri)).await;
        assert_eq!(job["status"], "cancelled");
    }

    #[tokio::test]
    async fn clear_deletes_all_jobs_newest_listed_first() {
        let app = app(AppState::new(orchestrator().await));
        for name in ["first", "second"] {
            let payload = format!(r#"{{"task_name": "{name}", "duration_hours": 1, "resource_usage": "low"}}"#);
            let (status, _) = send(&app, schedule_request(&payload)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, jobs) = send(&app, request("GET", "/api/jobs")).await;
        let names: Vec<&str> = jobs
            .as_array()
            .unwrap()
            .iter()
            .map(|j| j["task_name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["second", "first"]);

        let (status, body) = send(&app, request("DELETE", "/api/jobs/clear")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 2);

        let (_, jobs) = send(&app, request("GET", "/api/jobs")).await;
        assert_eq!(jobs, Value::Array(vec![]));
    }

    #[tokio::test]
    async fn storage_failure_is_a_server_error() {
        let orchestrator = orchestrator().await;
        orchestrator.store().pool().close().await;
        let app = app(AppState::new(orchestrator));

        let (status, body) = send(
            &app,
            schedule_request(r#"{"task_name": "backup", "duration_hours": 1, "resource_usage": "low"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["type"], "storage_error");

        let (status, _) = send(&app, request("DELETE", "/api/jobs/clear")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn carbon_status_reports_simulated_source() {
        let app = app(AppState::new(orchestrator().await));
        let (status, body) = send(&app, request("GET", "/api/carbon/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data_source"], "simulated");
        assert_eq!(body["credentials_configured"], false);
    }

    #[tokio::test]
    async fn configured_origin_receives_cors_headers() {
        let state = AppState::new(orchestrator().await)
            .with_cors_origins(vec!["http://localhost:3000".to_string()]);
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN].to_str().unwrap(),
            "http://localhost:3000"
        );
    }
}
