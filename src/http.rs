//! HTTP 接口
//!
//! - `GET /health`
//! - `POST /tasks`，`GET /tasks/{id}`，`POST /tasks/{id}/cancel`
//! - `GET /nodes/{sn}/notifications`：节点拉取证书更新通知
//! - `POST /nodes/{sn}/result`：节点回报证书更新结果

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use edgefleet_certupdater::{CertUpdater, NodeResult};
use edgefleet_dispatcher::Scheduler;
use edgefleet_domain::{CertKind, FleetError, TaskSpec, TaskStatus};
use edgefleet_limiter::adapters::{with_limits, LimitHandler};
use serde::{Deserialize, Serialize};

use crate::collaborators::Mailbox;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub updaters: Arc<HashMap<CertKind, Arc<CertUpdater>>>,
    pub mailbox: Arc<Mailbox>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now(),
        }
    }
}

pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            e if e.is_capacity() => StatusCode::TOO_MANY_REQUESTS,
            FleetError::Validation(_) | FleetError::Serialization(_) => StatusCode::BAD_REQUEST,
            FleetError::TaskAlreadyFinished | FleetError::CertUpdate(_) => StatusCode::CONFLICT,
            FleetError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            message: Some(self.0.to_string()),
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
pub struct HealthView {
    pub status: &'static str,
    pub active_tasks: i64,
    pub rotations: Vec<RotationView>,
}

#[derive(Debug, Serialize)]
pub struct RotationView {
    pub cert_type: &'static str,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub spec: TaskSpec,
    pub status: TaskStatus,
}

/// 节点回报的结果，证书类型决定交给哪个轮换
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResultRequest {
    pub cert_type: String,
    pub result_code: i64,
    #[serde(default)]
    pub desc: String,
}

pub fn router(state: AppState, limits: Arc<LimitHandler>) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/nodes/{sn}/notifications", get(node_notifications))
        .route("/nodes/{sn}/result", post(node_result))
        .with_state(state);
    with_limits(routes, limits)
}

async fn health(State(state): State<AppState>) -> ApiResult<HealthView> {
    let mut rotations: Vec<RotationView> = state
        .updaters
        .values()
        .map(|u| RotationView {
            cert_type: u.kind().cert_type(),
            running: u.is_running(),
        })
        .collect();
    rotations.sort_by_key(|r| r.cert_type);
    Ok(Json(ApiResponse::success(HealthView {
        status: "ok",
        active_tasks: state.scheduler.active_task_count(),
        rotations,
    })))
}

async fn submit_task(State(state): State<AppState>, Json(spec): Json<TaskSpec>) -> ApiResult<TaskSpec> {
    let spec = state.scheduler.submit_task(spec).await?;
    Ok(Json(ApiResponse::success(spec)))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TaskView> {
    let ctx = state.scheduler.get_task_context(&id).await?;
    let status = ctx.get_status().await?;
    Ok(Json(ApiResponse::success(TaskView {
        spec: ctx.spec().clone(),
        status,
    })))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<String> {
    let ctx = state.scheduler.get_task_context(&id).await?;
    ctx.cancel();
    Ok(Json(ApiResponse::success(id)))
}

async fn node_notifications(State(state): State<AppState>, Path(sn): Path<String>) -> ApiResult<Vec<String>> {
    let messages = state
        .mailbox
        .drain(&sn)
        .ok_or_else(|| FleetError::Validation(format!("未登记的节点: {sn}")))?;
    Ok(Json(ApiResponse::success(messages)))
}

async fn node_result(
    State(state): State<AppState>,
    Path(sn): Path<String>,
    Json(request): Json<NodeResultRequest>,
) -> ApiResult<()> {
    let kind = match request.cert_type.as_str() {
        "EdgeCa" => CertKind::EdgeCa,
        "EdgeSvc" => CertKind::EdgeSvc,
        other => return Err(FleetError::Validation(format!("无效的证书类型: {other}")).into()),
    };
    let updater = state
        .updaters
        .get(&kind)
        .ok_or_else(|| FleetError::CertUpdate(format!("未配置 {kind} 证书轮换")))?;
    if !updater.is_running() {
        return Err(FleetError::CertUpdate(format!("{kind} 证书轮换未在运行")).into());
    }
    updater.report_result(NodeResult {
        sn,
        result_code: request.result_code,
        desc: request.desc,
    });
    Ok(Json(ApiResponse::success(())))
}
