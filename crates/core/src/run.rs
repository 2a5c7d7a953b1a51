//! Simulation Run State
//!
//! A run is one student's attempt at one scenario. It carries the typed
//! orchestrator state, the per-scene progress records, and the bookkeeping the
//! progression engine needs. The conversation log lives beside it, not in it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::scenario::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    WaitingForBegin,
    InProgress,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::WaitingForBegin => "waiting_for_begin",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(RunStatus::NotStarted),
            "waiting_for_begin" => Some(RunStatus::WaitingForBegin),
            "in_progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime state of the scene machine, persisted as a JSON document on the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorState {
    pub current_scene_index: usize,
    pub turn_count: u32,
    pub simulation_started: bool,
    pub user_ready: bool,
    pub state_variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    InProgress,
    Completed,
}

impl SceneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SceneStatus::InProgress => "in_progress",
            SceneStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(SceneStatus::InProgress),
            "completed" => Some(SceneStatus::Completed),
            _ => None,
        }
    }
}

/// Mutable per-scene bookkeeping for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneProgressRecord {
    pub scene_id: Uuid,
    pub status: SceneStatus,
    /// Number of goal validations performed for this scene.
    pub attempts: u32,
    pub goal_achieved: bool,
    pub forced_progression: bool,
    pub user_messages: u32,
    pub ai_responses: u32,
    /// 0-100, present once the scene has been judged.
    pub achievement_score: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SceneProgressRecord {
    pub fn start(scene_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            scene_id,
            status: SceneStatus::InProgress,
            attempts: 0,
            goal_achieved: false,
            forced_progression: false,
            user_messages: 0,
            ai_responses: 0,
            achievement_score: None,
            started_at: now,
            completed_at: None,
        }
    }
}

/// One student's attempt at one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub id: Uuid,
    pub student_id: String,
    pub scenario_id: Uuid,
    pub current_scene_id: Option<Uuid>,
    pub status: RunStatus,
    /// Ordered, without duplicates.
    pub completed_scene_ids: Vec<Uuid>,
    pub forced_progressions: u32,
    pub orchestrator: OrchestratorState,
    pub scene_progress: Vec<SceneProgressRecord>,
    pub final_score: Option<f64>,
    /// Optimistic concurrency counter, bumped by every successful save.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SimulationRun {
    /// A fresh run waiting for the student's "begin", with the first scene's record open.
    pub fn new(student_id: &str, scenario: &Scenario, now: DateTime<Utc>) -> Self {
        let first_scene = scenario.scenes.first().map(|s| s.id);
        Self {
            id: Uuid::new_v4(),
            student_id: student_id.to_string(),
            scenario_id: scenario.id,
            current_scene_id: first_scene,
            status: RunStatus::WaitingForBegin,
            completed_scene_ids: Vec::new(),
            forced_progressions: 0,
            orchestrator: OrchestratorState::default(),
            scene_progress: first_scene
                .map(|id| vec![SceneProgressRecord::start(id, now)])
                .unwrap_or_default(),
            final_score: None,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_owned_by(&self, student_id: &str) -> bool {
        self.student_id == student_id
    }

    /// The open record for the current scene, if any.
    pub fn active_record_mut(&mut self) -> Option<&mut SceneProgressRecord> {
        self.scene_progress
            .iter_mut()
            .rev()
            .find(|r| r.status == SceneStatus::InProgress)
    }

    pub fn active_record(&self) -> Option<&SceneProgressRecord> {
        self.scene_progress
            .iter()
            .rev()
            .find(|r| r.status == SceneStatus::InProgress)
    }

    pub fn record_for(&self, scene_id: Uuid) -> Option<&SceneProgressRecord> {
        self.scene_progress.iter().rev().find(|r| r.scene_id == scene_id)
    }

    /// Brings a run whose stored state disagrees with its status back to a
    /// consistent shape. Returns true if anything changed.
    pub fn repair(&mut self, scenario: &Scenario, now: DateTime<Utc>) -> bool {
        if self.status != RunStatus::InProgress || scenario.scenes.is_empty() {
            return false;
        }
        let mut changed = false;

        let derived = self
            .current_scene_id
            .and_then(|id| scenario.scene_by_id(id))
            .map(|(index, _)| index);
        let index = match derived {
            Some(index) => index,
            None => self
                .orchestrator
                .current_scene_index
                .min(scenario.scenes.len() - 1),
        };
        if self.orchestrator.current_scene_index != index {
            self.orchestrator.current_scene_index = index;
            changed = true;
        }
        let scene_id = scenario.scenes[index].id;
        if self.current_scene_id != Some(scene_id) {
            self.current_scene_id = Some(scene_id);
            changed = true;
        }
        if !self.orchestrator.simulation_started || !self.orchestrator.user_ready {
            self.orchestrator.simulation_started = true;
            self.orchestrator.user_ready = true;
            changed = true;
        }

        let mut open = 0;
        for record in self.scene_progress.iter_mut() {
            if record.status == SceneStatus::InProgress {
                if record.scene_id == scene_id && open == 0 {
                    open += 1;
                } else {
                    record.status = SceneStatus::Completed;
                    record.completed_at = Some(now);
                    changed = true;
                }
            }
        }
        if open == 0 {
            self.scene_progress.push(SceneProgressRecord::start(scene_id, now));
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    AiPersona,
    Orchestrator,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::AiPersona => "ai_persona",
            MessageType::Orchestrator => "orchestrator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageType::User),
            "ai_persona" => Some(MessageType::AiPersona),
            "orchestrator" => Some(MessageType::Orchestrator),
            _ => None,
        }
    }
}

/// Append-only record of one message exchanged during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub scene_id: Uuid,
    pub message_type: MessageType,
    pub sender_name: String,
    pub persona_id: Option<String>,
    pub content: String,
    /// Monotonic within a run; assigned by the log store.
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
}

/// A log entry before the store assigns its identity and order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub run_id: Uuid,
    pub scene_id: Uuid,
    pub message_type: MessageType,
    pub sender_name: String,
    pub persona_id: Option<String>,
    pub content: String,
}

impl NewLogEntry {
    pub fn user(run_id: Uuid, scene_id: Uuid, student_id: &str, content: &str) -> Self {
        Self {
            run_id,
            scene_id,
            message_type: MessageType::User,
            sender_name: student_id.to_string(),
            persona_id: None,
            content: content.to_string(),
        }
    }

    pub fn persona(run_id: Uuid, scene_id: Uuid, persona_id: &str, name: &str, content: &str) -> Self {
        Self {
            run_id,
            scene_id,
            message_type: MessageType::AiPersona,
            sender_name: name.to_string(),
            persona_id: Some(persona_id.to_string()),
            content: content.to_string(),
        }
    }

    pub fn orchestrator(run_id: Uuid, scene_id: Uuid, content: &str) -> Self {
        Self {
            run_id,
            scene_id,
            message_type: MessageType::Orchestrator,
            sender_name: "Orchestrator".to_string(),
            persona_id: None,
            content: content.to_string(),
        }
    }

    /// The entry as the log will hold it once given `order_index`.
    pub fn staged(self, order_index: i64, created_at: DateTime<Utc>) -> ConversationLogEntry {
        ConversationLogEntry {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            scene_id: self.scene_id,
            message_type: self.message_type,
            sender_name: self.sender_name,
            persona_id: self.persona_id,
            content: self.content,
            order_index,
            created_at,
        }
    }
}
