//! Axum Router Configuration
//!
//! HTTP routes for runs, chat, goal validation and grading, plus the OpenAPI
//! document and Swagger UI.

use crate::{
    handlers,
    models::{
        ChatPayload, ChatResponse, ErrorResponse, GoalValidationResponse, GradeReportResponse,
        PersonaSummaryResponse, ProgressResponse, ScenarioSummaryResponse, SceneGradeResponse,
        ScenePayloadResponse, SceneProgressResponse, StartRunPayload, StartRunResponse,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::start_run,
        handlers::chat_turn,
        handlers::validate_goal,
        handlers::get_progress,
        handlers::grade_report,
    ),
    components(
        schemas(
            StartRunPayload, StartRunResponse, ChatPayload, ChatResponse, GoalValidationResponse,
            ProgressResponse, SceneProgressResponse, GradeReportResponse, SceneGradeResponse,
            ScenarioSummaryResponse, ScenePayloadResponse, PersonaSummaryResponse, ErrorResponse
        )
    ),
    tags(
        (name = "Case Simulation API", description = "Scene-based business case simulations")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/runs", post(handlers::start_run))
        .route("/runs/{id}", get(handlers::get_progress))
        .route("/runs/{id}/chat", post(handlers::chat_turn))
        .route(
            "/runs/{id}/scenes/{scene_id}/validate",
            post(handlers::validate_goal),
        )
        .route("/runs/{id}/grade", get(handlers::grade_report))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
