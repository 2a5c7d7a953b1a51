//! Shared Application State

use casesim_core::{grading::Grader, orchestrator::ChatOrchestrator};
use std::sync::Arc;

/// Created once at startup and shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub grader: Arc<Grader>,
}
