//! API and Database Models
//!
//! Row types map the PostgreSQL tables with `sqlx`; the payload and response
//! types describe the HTTP surface and feed the OpenAPI document via `utoipa`.
//! Domain types from `casesim_core` are converted at this edge.

use anyhow::{Context, anyhow};
use casesim_core::{
    goal::{GoalValidation, NextAction},
    grading::{GradeReport, SceneGrade},
    orchestrator::{ChatReply, StartedRun},
    run::{
        ConversationLogEntry, MessageType, OrchestratorState, RunStatus, SceneProgressRecord,
        SceneStatus, SimulationRun,
    },
    scenario::{Persona, PersonaArchetype, PersonaSummary, ScenarioSummary, Scene, ScenePayload},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use utoipa::ToSchema;
use uuid::Uuid;

// --- Rows ---

#[derive(FromRow, Debug, Clone)]
pub struct ScenarioRow {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub challenge: String,
    pub student_role: String,
}

#[derive(FromRow, Debug, Clone)]
pub struct PersonaRow {
    pub id: String,
    pub name: String,
    pub role: String,
    pub background: String,
    pub personality_traits: Json<Vec<String>>,
    pub goals: String,
    pub archetype: String,
}

impl From<PersonaRow> for Persona {
    fn from(row: PersonaRow) -> Self {
        Persona {
            id: row.id,
            name: row.name,
            role: row.role,
            background: row.background,
            personality_traits: row.personality_traits.0,
            goals: row.goals,
            archetype: PersonaArchetype::from_tag(&row.archetype),
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct SceneRow {
    pub id: Uuid,
    pub scene_order: i32,
    pub title: String,
    pub description: String,
    pub user_goal: String,
    pub success_metric: String,
    pub timeout_turns: i32,
}

impl SceneRow {
    pub fn into_scene(self, persona_ids: Vec<String>) -> Scene {
        Scene {
            id: self.id,
            scene_order: self.scene_order.max(1) as u32,
            title: self.title,
            description: self.description,
            user_goal: self.user_goal,
            success_metric: self.success_metric,
            timeout_turns: self.timeout_turns.max(0) as u32,
            persona_ids,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct ScenePersonaRow {
    pub scene_id: Uuid,
    pub persona_id: String,
}

#[derive(FromRow, Debug, Clone)]
pub struct RunRow {
    pub id: Uuid,
    pub student_id: String,
    pub scenario_id: Uuid,
    pub current_scene_id: Option<Uuid>,
    pub status: String,
    pub completed_scene_ids: Json<Vec<Uuid>>,
    pub forced_progressions: i32,
    pub orchestrator_state: Json<OrchestratorState>,
    pub final_score: Option<f64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn into_run(self, scene_progress: Vec<SceneProgressRecord>) -> anyhow::Result<SimulationRun> {
        let status = RunStatus::parse(&self.status)
            .with_context(|| format!("unknown run status '{}'", self.status))?;
        Ok(SimulationRun {
            id: self.id,
            student_id: self.student_id,
            scenario_id: self.scenario_id,
            current_scene_id: self.current_scene_id,
            status,
            completed_scene_ids: self.completed_scene_ids.0,
            forced_progressions: self.forced_progressions.max(0) as u32,
            orchestrator: self.orchestrator_state.0,
            scene_progress,
            final_score: self.final_score,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct SceneProgressRow {
    pub scene_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub goal_achieved: bool,
    pub forced_progression: bool,
    pub user_messages: i32,
    pub ai_responses: i32,
    pub achievement_score: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SceneProgressRow> for SceneProgressRecord {
    type Error = anyhow::Error;

    fn try_from(row: SceneProgressRow) -> anyhow::Result<Self> {
        let status = SceneStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown scene status '{}'", row.status))?;
        Ok(SceneProgressRecord {
            scene_id: row.scene_id,
            status,
            attempts: row.attempts.max(0) as u32,
            goal_achieved: row.goal_achieved,
            forced_progression: row.forced_progression,
            user_messages: row.user_messages.max(0) as u32,
            ai_responses: row.ai_responses.max(0) as u32,
            achievement_score: row.achievement_score,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct LogRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub scene_id: Uuid,
    pub message_type: String,
    pub sender_name: String,
    pub persona_id: Option<String>,
    pub content: String,
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for ConversationLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: LogRow) -> anyhow::Result<Self> {
        let message_type = MessageType::parse(&row.message_type)
            .ok_or_else(|| anyhow!("unknown message type '{}'", row.message_type))?;
        Ok(ConversationLogEntry {
            id: row.id,
            run_id: row.run_id,
            scene_id: row.scene_id,
            message_type,
            sender_name: row.sender_name,
            persona_id: row.persona_id,
            content: row.content,
            order_index: row.order_index,
            created_at: row.created_at,
        })
    }
}

// --- Payloads ---

#[derive(Deserialize, ToSchema)]
pub struct StartRunPayload {
    #[schema(value_type = String, format = Uuid)]
    pub scenario_id: Uuid,
}

#[derive(Deserialize, ToSchema)]
pub struct ChatPayload {
    /// The scene the client believes is current. Used to ignore stale submits.
    #[schema(value_type = Option<String>, format = Uuid)]
    #[serde(default)]
    pub scene_id: Option<Uuid>,
    #[schema(example = "@alice what is our cash runway?")]
    pub message: String,
}

// --- Responses ---

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct PersonaSummaryResponse {
    pub id: String,
    pub name: String,
    pub role: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ScenePayloadResponse {
    #[schema(value_type = String, format = Uuid)]
    pub scene_id: Uuid,
    pub index: usize,
    pub title: String,
    pub description: String,
    pub objectives: String,
    pub timeout_turns: u32,
    pub personas: Vec<PersonaSummaryResponse>,
}

impl From<ScenePayload> for ScenePayloadResponse {
    fn from(payload: ScenePayload) -> Self {
        Self {
            scene_id: payload.scene_id,
            index: payload.index,
            title: payload.title,
            description: payload.description,
            objectives: payload.objectives,
            timeout_turns: payload.timeout_turns,
            personas: payload
                .personas
                .into_iter()
                .map(|PersonaSummary { id, name, role }| PersonaSummaryResponse { id, name, role })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ScenarioSummaryResponse {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub challenge: String,
    pub student_role: String,
    pub scene_count: usize,
}

impl From<ScenarioSummary> for ScenarioSummaryResponse {
    fn from(summary: ScenarioSummary) -> Self {
        Self {
            id: summary.id,
            title: summary.title,
            description: summary.description,
            challenge: summary.challenge,
            student_role: summary.student_role,
            scene_count: summary.scene_count,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct StartRunResponse {
    #[schema(value_type = String, format = Uuid)]
    pub run_id: Uuid,
    pub scenario: ScenarioSummaryResponse,
    pub first_scene: Option<ScenePayloadResponse>,
    #[schema(example = "waiting_for_begin")]
    pub status: String,
}

impl From<StartedRun> for StartRunResponse {
    fn from(started: StartedRun) -> Self {
        Self {
            run_id: started.run.id,
            scenario: started.scenario.into(),
            first_scene: started.first_scene.map(Into::into),
            status: started.run.status.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ChatResponse {
    pub reply_text: String,
    #[schema(value_type = Option<String>, format = Uuid)]
    pub scene_id: Option<Uuid>,
    pub scene_completed: bool,
    #[schema(value_type = Option<String>, format = Uuid)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scene_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scene: Option<ScenePayloadResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_name: Option<String>,
    pub turn_count: u32,
    #[schema(example = "in_progress")]
    pub run_status: String,
}

impl From<ChatReply> for ChatResponse {
    fn from(reply: ChatReply) -> Self {
        Self {
            reply_text: reply.reply_text,
            scene_id: reply.scene_id,
            scene_completed: reply.scene_completed,
            next_scene_id: reply.next_scene_id,
            next_scene: reply.next_scene.map(Into::into),
            persona_name: reply.persona_name,
            turn_count: reply.turn_count,
            run_status: reply.run_status.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct GoalValidationResponse {
    pub goal_achieved: bool,
    pub confidence_score: f64,
    pub reasoning: String,
    #[schema(example = "continue")]
    pub next_action: String,
    pub hint_message: Option<String>,
}

impl From<GoalValidation> for GoalValidationResponse {
    fn from(verdict: GoalValidation) -> Self {
        let next_action = match verdict.next_action {
            NextAction::Continue => "continue",
            NextAction::Progress => "progress",
            NextAction::Hint => "hint",
            NextAction::ForceProgress => "force_progress",
        };
        Self {
            goal_achieved: verdict.goal_achieved,
            confidence_score: verdict.confidence_score,
            reasoning: verdict.reasoning,
            next_action: next_action.to_string(),
            hint_message: verdict.hint_message,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SceneProgressResponse {
    #[schema(value_type = String, format = Uuid)]
    pub scene_id: Uuid,
    #[schema(example = "in_progress")]
    pub status: String,
    pub attempts: u32,
    pub goal_achieved: bool,
    pub forced_progression: bool,
    pub user_messages: u32,
    pub ai_responses: u32,
    pub achievement_score: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<SceneProgressRecord> for SceneProgressResponse {
    fn from(record: SceneProgressRecord) -> Self {
        Self {
            scene_id: record.scene_id,
            status: record.status.as_str().to_string(),
            attempts: record.attempts,
            goal_achieved: record.goal_achieved,
            forced_progression: record.forced_progression,
            user_messages: record.user_messages,
            ai_responses: record.ai_responses,
            achievement_score: record.achievement_score,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ProgressResponse {
    #[schema(value_type = String, format = Uuid)]
    pub run_id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub scenario_id: Uuid,
    #[schema(example = "in_progress")]
    pub status: String,
    #[schema(value_type = Option<String>, format = Uuid)]
    pub current_scene_id: Option<Uuid>,
    pub current_scene_index: usize,
    pub turn_count: u32,
    #[schema(value_type = Vec<String>)]
    pub completed_scene_ids: Vec<Uuid>,
    pub forced_progressions: u32,
    pub final_score: Option<f64>,
    pub scene_progress: Vec<SceneProgressResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<SimulationRun> for ProgressResponse {
    fn from(run: SimulationRun) -> Self {
        Self {
            run_id: run.id,
            scenario_id: run.scenario_id,
            status: run.status.to_string(),
            current_scene_id: run.current_scene_id,
            current_scene_index: run.orchestrator.current_scene_index,
            turn_count: run.orchestrator.turn_count,
            completed_scene_ids: run.completed_scene_ids,
            forced_progressions: run.forced_progressions,
            final_score: run.final_score,
            scene_progress: run.scene_progress.into_iter().map(Into::into).collect(),
            created_at: run.created_at,
            updated_at: run.updated_at,
            completed_at: run.completed_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SceneGradeResponse {
    #[schema(value_type = String, format = Uuid)]
    pub scene_id: Uuid,
    pub title: String,
    pub score: Option<f64>,
    pub feedback: String,
}

impl From<SceneGrade> for SceneGradeResponse {
    fn from(grade: SceneGrade) -> Self {
        Self {
            scene_id: grade.scene_id,
            title: grade.title,
            score: grade.score,
            feedback: grade.feedback,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct GradeReportResponse {
    pub overall_score: Option<f64>,
    pub overall_feedback: String,
    pub per_scene: Vec<SceneGradeResponse>,
}

impl From<GradeReport> for GradeReportResponse {
    fn from(report: GradeReport) -> Self {
        Self {
            overall_score: report.overall_score,
            overall_feedback: report.overall_feedback,
            per_scene: report.per_scene.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run_row(status: &str) -> RunRow {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        RunRow {
            id: Uuid::new_v4(),
            student_id: "student_1".to_string(),
            scenario_id: Uuid::new_v4(),
            current_scene_id: Some(Uuid::new_v4()),
            status: status.to_string(),
            completed_scene_ids: Json(vec![]),
            forced_progressions: 2,
            orchestrator_state: Json(OrchestratorState {
                current_scene_index: 1,
                turn_count: 4,
                simulation_started: true,
                user_ready: true,
                ..Default::default()
            }),
            final_score: None,
            version: 7,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_run_row_into_run() {
        let row = run_row("in_progress");
        let id = row.id;
        let run = row.into_run(vec![]).unwrap();

        assert_eq!(run.id, id);
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.orchestrator.turn_count, 4);
        assert_eq!(run.forced_progressions, 2);
        assert_eq!(run.version, 7);
    }

    #[test]
    fn test_run_row_rejects_unknown_status() {
        let err = run_row("paused").into_run(vec![]).unwrap_err();
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn test_orchestrator_state_tolerates_missing_fields() {
        let state: OrchestratorState = serde_json::from_str(r#"{"turn_count": 3}"#).unwrap();
        assert_eq!(state.turn_count, 3);
        assert_eq!(state.current_scene_index, 0);
        assert!(!state.simulation_started);
    }

    #[test]
    fn test_scene_row_clamps_negative_values() {
        let row = SceneRow {
            id: Uuid::new_v4(),
            scene_order: 0,
            title: "Kickoff".to_string(),
            description: String::new(),
            user_goal: String::new(),
            success_metric: String::new(),
            timeout_turns: -3,
        };
        let scene = row.into_scene(vec!["alice_jones".to_string()]);
        assert_eq!(scene.scene_order, 1);
        assert_eq!(scene.timeout_turns, 0);
        assert_eq!(scene.effective_timeout(), 15);
        assert_eq!(scene.persona_ids, vec!["alice_jones"]);
    }

    #[test]
    fn test_persona_row_maps_archetype() {
        let row = PersonaRow {
            id: "bob_smith".to_string(),
            name: "Bob Smith".to_string(),
            role: "Investor".to_string(),
            background: String::new(),
            personality_traits: Json(vec!["skeptical".to_string()]),
            goals: String::new(),
            archetype: "investor".to_string(),
        };
        let persona = Persona::from(row);
        assert_eq!(persona.archetype, PersonaArchetype::Investor);
        assert_eq!(persona.personality_traits, vec!["skeptical"]);
    }

    #[test]
    fn test_log_row_conversion() {
        let row = LogRow {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            scene_id: Uuid::new_v4(),
            message_type: "ai_persona".to_string(),
            sender_name: "Alice Jones".to_string(),
            persona_id: Some("alice_jones".to_string()),
            content: "Our runway is nine months.".to_string(),
            order_index: 3,
            created_at: Utc::now(),
        };
        let bad = LogRow {
            message_type: "system".to_string(),
            ..row.clone()
        };

        let entry = ConversationLogEntry::try_from(row).unwrap();
        assert_eq!(entry.message_type, MessageType::AiPersona);
        assert_eq!(entry.order_index, 3);
        assert!(ConversationLogEntry::try_from(bad).is_err());
    }

    #[test]
    fn test_chat_payload_scene_id_is_optional() {
        let payload: ChatPayload = serde_json::from_str(r#"{"message": "begin"}"#).unwrap();
        assert_eq!(payload.scene_id, None);
        assert_eq!(payload.message, "begin");

        let result: Result<ChatPayload, _> = serde_json::from_str(r#"{"scene_id": null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_chat_response_omits_empty_optionals() {
        let response = ChatResponse {
            reply_text: "Noted.".to_string(),
            scene_id: None,
            scene_completed: false,
            next_scene_id: None,
            next_scene: None,
            persona_name: None,
            turn_count: 1,
            run_status: "in_progress".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("next_scene_id").is_none());
        assert!(json.get("persona_name").is_none());
        assert_eq!(json["run_status"], "in_progress");
    }

    #[test]
    fn test_goal_validation_response_wire_names() {
        let verdict = GoalValidation {
            goal_achieved: false,
            confidence_score: 0.3,
            reasoning: "Not yet".to_string(),
            next_action: NextAction::ForceProgress,
            hint_message: None,
        };
        let response = GoalValidationResponse::from(verdict);
        assert_eq!(response.next_action, "force_progress");
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "run not found".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"message":"run not found"}"#);
    }
}
