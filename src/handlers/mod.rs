use crate::error::{BackupError, ServiceListError, ThresholdError};
use crate::models::config::{normalize_service_name, parse_schedule};
use crate::models::metrics::ConditionCode;
use crate::services::prober::ServiceProber;
use crate::services::scheduler::BackupJob;
use crate::services::state::{AlertOverrides, SharedStatus, ThresholdStore, WhitelistStore};
use crate::utils::logging::log_action;
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::warn;

// State
#[derive(Clone)]
pub struct AppState {
    pub thresholds: ThresholdStore,
    pub overrides: AlertOverrides,
    pub status: SharedStatus,
    pub services: WhitelistStore,
    pub prober: Arc<dyn ServiceProber>,
    pub backup: BackupJob,
    pub schedule: Arc<watch::Sender<NaiveTime>>,
    pub api_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

impl From<ThresholdError> for ApiError {
    fn from(e: ThresholdError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        let message = e.to_string();
        match e {
            BackupError::ManifestNotFound(_) => ApiError::NotFound(message),
            BackupError::InvalidLabel(_) => ApiError::BadRequest(message),
            BackupError::LabelExists(_) => ApiError::Conflict(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<ServiceListError> for ApiError {
    fn from(e: ServiceListError) -> Self {
        match e {
            ServiceListError::InvalidName(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/thresholds", get(get_thresholds))
        .route("/api/thresholds/:metric", put(set_threshold))
        .route("/api/alerts", get(list_disabled_alerts))
        .route("/api/alerts/:code/disable", post(disable_alert))
        .route("/api/services", get(list_services))
        .route("/api/services/:name", post(add_service).delete(remove_service))
        .route("/api/backups", get(list_backups).post(run_backup))
        .route("/api/backups/schedule", put(set_backup_schedule))
        .route("/api/backups/:label/verify", post(verify_backup))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.api_token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if provided != Some(expected.as_str()) {
            warn!(path = %request.uri().path(), "Rejected admin request without valid token");
            return (StatusCode::UNAUTHORIZED, "Missing or invalid token").into_response();
        }
    }
    next.run(request).await
}

// Routes
async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let board = state.status.read().await;
    let thresholds = state.thresholds.get();
    Json(json!({
        "status": &*board,
        "thresholds": &*thresholds,
        "disabled_alerts": state.overrides.active(Utc::now()),
    }))
}

async fn get_thresholds(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.thresholds.get().as_ref().clone())
}

#[derive(Deserialize)]
struct ThresholdUpdate {
    value: Value,
}

async fn set_threshold(
    State(state): State<AppState>,
    Path(metric): Path<String>,
    Json(update): Json<ThresholdUpdate>,
) -> ApiResult<impl IntoResponse> {
    let raw = match update.value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let updated = state
        .thresholds
        .update(|current| current.with_value(&metric, &raw))?;
    log_action("admin.threshold", None, "ok", &format!("{metric}={raw}"));
    Ok(Json(updated.as_ref().clone()))
}

async fn list_disabled_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.overrides.active(Utc::now()))
}

#[derive(Deserialize)]
struct DisableRequest {
    minutes: u32,
}

async fn disable_alert(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(request): Json<DisableRequest>,
) -> ApiResult<impl IntoResponse> {
    let code: ConditionCode = code.parse().map_err(ApiError::BadRequest)?;
    if request.minutes == 0 {
        return Err(ApiError::BadRequest("minutes must be greater than zero".to_string()));
    }
    let until = state.overrides.disable(code.clone(), request.minutes, Utc::now());
    log_action(
        "admin.alert_disable",
        None,
        "ok",
        &format!("{code} for {}m", request.minutes),
    );
    Ok(Json(json!({ "code": code, "until": until })))
}

async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.services.get().as_ref().clone())
}

async fn add_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = normalize_service_name(&name)?;
    if let Err(reason) = state.prober.check_unit(&service).await {
        log_action("admin.svc_add", None, "fail", &service);
        return Err(ApiError::NotFound(reason));
    }
    let added = state.services.add(&service)?;
    let status = if added {
        log_action("admin.svc_add", None, "ok", &service);
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "service": service, "added": added }))))
}

async fn remove_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = normalize_service_name(&name)?;
    if !state.services.remove(&service)? {
        return Err(ApiError::NotFound(format!("{service} is not whitelisted")));
    }
    log_action("admin.svc_remove", None, "ok", &service);
    Ok(Json(json!({ "service": service, "removed": true })))
}

async fn list_backups(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let engine = state.backup.engine().clone();
    let snapshots = tokio::task::spawn_blocking(move || engine.list_snapshots()).await??;
    Ok(Json(snapshots))
}

async fn run_backup(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    match state.backup.run_now().await {
        Ok(report) => {
            log_action("admin.backup", None, "ok", &report.snapshot.display().to_string());
            Ok(Json(report))
        }
        Err(e) => {
            log_action("admin.backup", None, "fail", &e.to_string());
            Err(match e.downcast::<BackupError>() {
                Ok(backup) => backup.into(),
                Err(other) => ApiError::Internal(other.to_string()),
            })
        }
    }
}

async fn verify_backup(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let engine = state.backup.engine().clone();
    let checked = label.clone();
    let mismatches = tokio::task::spawn_blocking(move || engine.verify_label(&checked)).await??;
    let result = if mismatches.is_empty() { "ok" } else { "mismatch" };
    log_action("admin.backup_verify", None, result, &label);
    Ok(Json(json!({
        "label": label,
        "intact": mismatches.is_empty(),
        "mismatches": mismatches,
    })))
}

#[derive(Deserialize)]
struct ScheduleRequest {
    time: String,
}

async fn set_backup_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let at = parse_schedule(&request.time).map_err(ApiError::BadRequest)?;
    state.schedule.send_replace(at);
    let formatted = at.format("%H:%M").to_string();
    log_action("admin.backup_schedule", None, "ok", &formatted);
    Ok(Json(json!({ "schedule": formatted })))
}
