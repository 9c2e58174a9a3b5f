//! HTTP API for task intake, lookup, abort, loan queries and health

use crate::config::ApiConfig;
use crate::coordination::TaskDriver;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::ledger::{LedgerFacade, LoanDetails};
use crate::state::TaskStore;
use crate::task::{OperationRecord, Task, TaskParams, TaskType};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub ledger: Arc<LedgerFacade>,
    pub driver: Arc<TaskDriver>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/abort", post(abort_task))
        .route("/tasks/:id/resume", post(resume_task))
        .route("/loans/:user_id", get(get_loan))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Config(format!("binding {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| CoordinatorError::Internal(format!("api server: {}", e)))
}

/// Error body with a status derived from the error class
pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoordinatorError::Validation(_)
            | CoordinatorError::InvalidAmount(_)
            | CoordinatorError::PreconditionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoordinatorError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoordinatorError::ConcurrentModification { .. }
            | CoordinatorError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            CoordinatorError::Database(_)
            | CoordinatorError::ChainConnection(_)
            | CoordinatorError::PollerUnavailable { .. }
            | CoordinatorError::SettlementTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - task store and ledger reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.health_check().await.is_ok();
    let ledger = state.ledger.health_check().await;
    let ready = store && ledger;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store,
            ledger,
        }),
    )
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state
        .store
        .create(&request.user_id, request.task_type, request.params)
        .await?;
    info!("Accepted {} task {} for {}", task.task_type, task.id, task.user_id);
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state.store.get(task_id).await?;
    let operations = state.store.operations(task_id).await?;
    Ok(Json(TaskResponse { task, operations }))
}

async fn abort_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<(StatusCode, Json<AbortResponse>), ApiError> {
    let task = state.store.get(task_id).await?;
    if task.progress.is_terminal() {
        return Err(CoordinatorError::InvalidStateTransition {
            from: task.progress.to_string(),
            to: "aborted".to_string(),
        }
        .into());
    }

    let interrupted = state.driver.abort(task_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(AbortResponse {
            task_id,
            interrupted,
        }),
    ))
}

async fn resume_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.get(task_id).await?;
    state.driver.resume(task_id);
    Ok(StatusCode::ACCEPTED)
}

async fn get_loan(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<LoanDetails>, ApiError> {
    Ok(Json(state.ledger.loan_details(&user_id).await?))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(StatsResponse {
        total: stats.total(),
        by_progress: stats.by_progress,
        running: state.driver.running(),
        parked: state.driver.parked(),
    }))
}

// Request and response types

#[derive(Deserialize)]
struct CreateTaskRequest {
    user_id: String,
    task_type: TaskType,
    #[serde(default)]
    params: TaskParams,
}

#[derive(Serialize)]
struct TaskResponse {
    #[serde(flatten)]
    task: Task,
    operations: Vec<OperationRecord>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    ledger: bool,
}

#[derive(Serialize)]
struct AbortResponse {
    task_id: Uuid,
    interrupted: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    total: u64,
    by_progress: BTreeMap<String, u64>,
    running: usize,
    parked: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, SettlementConfig};
    use crate::coordination::Orchestrator;
    use crate::ledger::testing::FakeLedger;
    use crate::settlement::testing::StatusBoard;
    use crate::settlement::SettlementPoller;
    use crate::state::MemoryTaskStore;

    use axum::body::{to_bytes, Body};
    use ethers::types::U256;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryTaskStore>) {
        app_with(Arc::new(FakeLedger::funded()))
    }

    fn app_with(backend: Arc<FakeLedger>) -> (Router, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        let ledger = Arc::new(LedgerFacade::new(backend));
        let poller = Arc::new(SettlementPoller::new(
            Arc::new(StatusBoard::default()),
            &SettlementConfig::default(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            ledger.clone(),
            poller,
            Duration::from_secs(60),
        ));
        let driver = Arc::new(TaskDriver::new(
            orchestrator,
            store.clone(),
            CoordinatorConfig {
                instance_id: "test".to_string(),
                scan_interval_ms: 1000,
                max_concurrent_tasks: 4,
                max_ambiguous_attempts: 3,
                health_check_interval_secs: 30,
            },
        ));
        let state = AppState {
            store: store.clone(),
            ledger,
            driver,
        };
        (router(state), store)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_create_and_fetch_task() {
        let (app, _) = app();

        let (status, created) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({
                "user_id": "lender-1",
                "task_type": "SendUSDC",
                "params": { "principal": "250" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["progress"], "Started");

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = send(&app, "GET", &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["task_type"], "SendUSDC");
        assert_eq!(fetched["operations"], json!([]));
    }

    #[tokio::test]
    async fn test_missing_params_are_unprocessable() {
        let (app, store) = app();

        let (status, body) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({ "user_id": "borrower-1", "task_type": "GetLoan" })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("GetLoan"));
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (app, _) = app();
        let (status, _) = send(&app, "GET", &format!("/tasks/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/tasks/{}/abort", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_abort_parks_idle_task() {
        let (app, store) = app();
        let task = store
            .create(
                "lender-1",
                TaskType::WithdrawDeposit,
                TaskParams {
                    principal: Some("10".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (status, body) = send(&app, "POST", &format!("/tasks/{}/abort", task.id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["interrupted"], false);

        let (_, stats) = send(&app, "GET", "/stats", None).await;
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["by_progress"]["Started"], 1);
        assert_eq!(stats["parked"], json!([task.id.to_string()]));
    }

    #[tokio::test]
    async fn test_loan_details_by_user() {
        let backend = Arc::new(FakeLedger::funded());
        {
            let mut loan = backend.loan.lock().unwrap();
            loan.loan_amount = U256::from(250_000_000u64);
            loan.interest = U256::from(1_250_000u64);
            loan.collateral = U256::exp10(18);
            loan.active = true;
        }
        let (app, _) = app_with(backend);

        let (status, body) = send(&app, "GET", "/loans/borrower-1", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loanAmount"], "250.000000");
        assert_eq!(body["totalDue"], "251.250000");
        assert_eq!(body["collateralAmount"], "1.000000000000000000");
        assert_eq!(body["active"], true);
        assert_eq!(body["liquidated"], false);
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (app, _) = app();

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }
}
