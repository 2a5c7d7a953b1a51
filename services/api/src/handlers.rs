//! Axum Handlers for the REST API
//!
//! Thin adapters from HTTP to the chat orchestrator and the grader. The
//! caller's identity arrives in the `x-user-id` header; authenticating it is
//! the job of whatever sits in front of this service.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use casesim_core::SimulationError;
use std::sync::Arc;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::{
    models::{
        ChatPayload, ChatResponse, ErrorResponse, GoalValidationResponse, GradeReportResponse,
        ProgressResponse, StartRunPayload, StartRunResponse,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<SimulationError> for ApiError {
    fn from(err: SimulationError) -> Self {
        match err {
            SimulationError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SimulationError::Unauthorized(run_id) => {
                warn!(%run_id, "Rejected access to another student's run");
                ApiError::Forbidden(err.to_string())
            }
            SimulationError::Conflict(_) => ApiError::Conflict(err.to_string()),
            SimulationError::Internal(inner) => ApiError::InternalServerError(inner),
        }
    }
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

/// Start a new simulation run, replacing any earlier run of the same scenario.
#[utoipa::path(
    post,
    path = "/runs",
    request_body = StartRunPayload,
    responses(
        (status = 201, description = "Run created and waiting for \"begin\"", body = StartRunResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 404, description = "Scenario not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the student starting the run")
    )
)]
#[instrument(skip_all, fields(scenario_id = %payload.scenario_id))]
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<StartRunPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;
    let started = state
        .orchestrator
        .start_run(user_id, payload.scenario_id)
        .await?;
    Ok((StatusCode::CREATED, Json(StartRunResponse::from(started))))
}

/// Send one chat message to a run.
#[utoipa::path(
    post,
    path = "/runs/{id}/chat",
    request_body = ChatPayload,
    responses(
        (status = 200, description = "The orchestrator's reply", body = ChatResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 403, description = "Run belongs to another student", body = ErrorResponse),
        (status = 404, description = "Run or scene not found", body = ErrorResponse),
        (status = 409, description = "Run was modified concurrently", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Run ID"),
        ("x-user-id" = String, Header, description = "The ID of the student")
    )
)]
#[instrument(skip_all, fields(run_id = %id))]
pub async fn chat_turn(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<ChatResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let reply = state
        .orchestrator
        .handle_turn(user_id, id, payload.scene_id, &payload.message)
        .await?;
    Ok(Json(reply.into()))
}

/// Ask whether a scene's goal has been met, without changing the run.
#[utoipa::path(
    post,
    path = "/runs/{id}/scenes/{scene_id}/validate",
    responses(
        (status = 200, description = "Goal validation verdict", body = GoalValidationResponse),
        (status = 403, description = "Run belongs to another student", body = ErrorResponse),
        (status = 404, description = "Run or scene not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Run ID"),
        ("scene_id" = Uuid, Path, description = "Scene ID"),
        ("x-user-id" = String, Header, description = "The ID of the student")
    )
)]
#[instrument(skip_all, fields(run_id = %id, %scene_id))]
pub async fn validate_goal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, scene_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<GoalValidationResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let verdict = state
        .orchestrator
        .validate_goal(user_id, id, scene_id)
        .await?;
    Ok(Json(verdict.into()))
}

/// Get a run's progress, including every scene record.
#[utoipa::path(
    get,
    path = "/runs/{id}",
    responses(
        (status = 200, description = "Run snapshot", body = ProgressResponse),
        (status = 403, description = "Run belongs to another student", body = ErrorResponse),
        (status = 404, description = "Run not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Run ID"),
        ("x-user-id" = String, Header, description = "The ID of the student")
    )
)]
#[instrument(skip_all, fields(run_id = %id))]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let run = state.orchestrator.progress(user_id, id).await?;
    Ok(Json(run.into()))
}

/// Grade every scene of a run.
#[utoipa::path(
    get,
    path = "/runs/{id}/grade",
    responses(
        (status = 200, description = "Grade report", body = GradeReportResponse),
        (status = 403, description = "Run belongs to another student", body = ErrorResponse),
        (status = 404, description = "Run not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Run ID"),
        ("x-user-id" = String, Header, description = "The ID of the student")
    )
)]
#[instrument(skip_all, fields(run_id = %id))]
pub async fn grade_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<GradeReportResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let report = state.grader.grade(user_id, id, None).await?;
    Ok(Json(report.into()))
}
