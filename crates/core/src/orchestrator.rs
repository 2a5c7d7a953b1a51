//! Chat Orchestrator
//!
//! The single entry point for a student's message inside a run. A message is
//! routed to a command (`begin`, `help`, submit), to a mentioned persona, or
//! to the general facilitator voice. Exactly one reply is produced, the
//! progression engine is consulted, and the run is persisted before returning.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{SimulationError, SimulationResult};
use crate::goal::{GoalValidation, GoalValidator, NextAction, ValidationPolicy, ValidationRequest};
use crate::llm_client::{LLMClient, PromptMessage};
use crate::mention::{self, parse_mention};
use crate::progression::{BeginOutcome, SceneProgression, Transition, TurnEvaluation, Trigger};
use crate::prompt::{self, PromptTemplates, format_transcript, scene_memory};
use crate::run::{ConversationLogEntry, MessageType, NewLogEntry, RunStatus, SimulationRun};
use crate::scenario::{Scenario, ScenarioSummary, Scene, ScenePayload};
use crate::store::{ConversationLog, RunStore, ScenarioCatalog};

/// Sentinel a client sends when the student submits the current scene.
pub const SUBMIT_SENTINEL: &str = "[SUBMIT_FOR_GRADING]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Begin,
    Help,
    Submit,
}

/// Recognises the bare command words. Anything else is a conversational turn.
pub fn classify(message: &str) -> Option<Command> {
    let trimmed = message.trim();
    if trimmed.eq_ignore_ascii_case(SUBMIT_SENTINEL) || trimmed.eq_ignore_ascii_case("submit") {
        return Some(Command::Submit);
    }
    match trimmed.to_lowercase().as_str() {
        "begin" => Some(Command::Begin),
        "help" => Some(Command::Help),
        _ => None,
    }
}

/// Result of starting a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedRun {
    pub run: SimulationRun,
    pub scenario: ScenarioSummary,
    pub first_scene: Option<ScenePayload>,
}

/// The orchestrator's answer to one chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply_text: String,
    /// The scene the message was handled in.
    pub scene_id: Option<Uuid>,
    pub scene_completed: bool,
    pub next_scene_id: Option<Uuid>,
    pub next_scene: Option<ScenePayload>,
    pub persona_name: Option<String>,
    pub turn_count: u32,
    pub run_status: RunStatus,
}

impl ChatReply {
    fn new(run: &SimulationRun, reply_text: String) -> Self {
        Self {
            reply_text,
            scene_id: run.current_scene_id,
            scene_completed: false,
            next_scene_id: None,
            next_scene: None,
            persona_name: None,
            turn_count: run.orchestrator.turn_count,
            run_status: run.status,
        }
    }

    fn apply_transition(&mut self, run: &SimulationRun, scenario: &Scenario, transition: &Transition) {
        let completed_title = scenario
            .scene_by_id(transition.from_scene())
            .map(|(_, s)| s.title.clone())
            .unwrap_or_default();
        let next = match transition {
            Transition::Advanced { to_index, .. } => scenario
                .scene_at(*to_index)
                .map(|scene| ScenePayload::build(scenario, *to_index, scene)),
            Transition::Completed { .. } => None,
        };
        let announcement =
            prompt::transition_text(&completed_title, transition.trigger(), next.as_ref());

        self.reply_text = if self.reply_text.is_empty() {
            announcement
        } else {
            format!("{}\n\n{}", self.reply_text, announcement)
        };
        self.scene_completed = true;
        self.next_scene_id = next.as_ref().map(|p| p.scene_id);
        self.next_scene = next;
        self.turn_count = run.orchestrator.turn_count;
        self.run_status = run.status;
    }
}

/// Serialises writers per run within this process.
#[derive(Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    pub async fn acquire(&self, run_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Idle entries are only referenced by the map itself.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(run_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Log entries produced while handling one turn.
///
/// Nothing reaches the conversation log until the run itself has been saved,
/// so a turn rejected as a conflict leaves no trace.
#[derive(Debug, Default)]
struct TurnLog {
    entries: Vec<NewLogEntry>,
}

impl TurnLog {
    fn push(&mut self, entry: NewLogEntry) {
        self.entries.push(entry);
    }

    /// `prior` followed by this turn's entries for `scene_id`, ordered as they will be stored.
    fn staged(
        &self,
        prior: &[ConversationLogEntry],
        scene_id: Uuid,
        now: DateTime<Utc>,
    ) -> Vec<ConversationLogEntry> {
        let next_index = prior.last().map_or(0, |e| e.order_index + 1);
        let pending = self
            .entries
            .iter()
            .filter(|e| e.scene_id == scene_id)
            .zip(next_index..)
            .map(|(entry, order_index)| entry.clone().staged(order_index, now));
        prior.iter().cloned().chain(pending).collect()
    }
}

/// Routes chat messages and owns the per-run write discipline.
pub struct ChatOrchestrator {
    runs: Arc<dyn RunStore>,
    catalog: Arc<dyn ScenarioCatalog>,
    log: Arc<dyn ConversationLog>,
    llm: Arc<dyn LLMClient>,
    validator: Arc<dyn GoalValidator>,
    templates: Arc<PromptTemplates>,
    policy: ValidationPolicy,
    locks: RunLocks,
}

impl ChatOrchestrator {
    pub fn new(
        runs: Arc<dyn RunStore>,
        catalog: Arc<dyn ScenarioCatalog>,
        log: Arc<dyn ConversationLog>,
        llm: Arc<dyn LLMClient>,
        validator: Arc<dyn GoalValidator>,
        templates: Arc<PromptTemplates>,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            runs,
            catalog,
            log,
            llm,
            validator,
            templates,
            policy,
            locks: RunLocks::default(),
        }
    }

    /// Starts a fresh run, discarding any earlier attempt at the same scenario.
    #[instrument(skip(self))]
    pub async fn start_run(&self, student_id: &str, scenario_id: Uuid) -> SimulationResult<StartedRun> {
        let scenario = self.load_scenario(scenario_id).await?;
        let run = SimulationRun::new(student_id, &scenario, Utc::now());
        self.runs.replace_run(&run).await?;

        if let Some(first) = scenario.scenes.first() {
            self.log
                .append(NewLogEntry::orchestrator(run.id, first.id, &prompt::welcome_text(&scenario)))
                .await?;
        }
        info!(run_id = %run.id, "Simulation run created");

        Ok(StartedRun {
            first_scene: scenario
                .scenes
                .first()
                .map(|scene| ScenePayload::build(&scenario, 0, scene)),
            scenario: ScenarioSummary::from(&scenario),
            run,
        })
    }

    /// Snapshot of a run for its owner.
    pub async fn progress(&self, student_id: &str, run_id: Uuid) -> SimulationResult<SimulationRun> {
        self.load_owned(student_id, run_id).await
    }

    /// Runs goal validation for a scene without changing the run.
    #[instrument(skip(self))]
    pub async fn validate_goal(
        &self,
        student_id: &str,
        run_id: Uuid,
        scene_id: Uuid,
    ) -> SimulationResult<GoalValidation> {
        let run = self.load_owned(student_id, run_id).await?;
        let scenario = self.load_scenario(run.scenario_id).await?;
        let (_, scene) = scenario
            .scene_by_id(scene_id)
            .ok_or_else(|| SimulationError::NotFound(format!("scene {}", scene_id)))?;

        let attempts = run.record_for(scene_id).map_or(0, |r| r.attempts);
        let entries = self.log.scene_entries(run.id, scene_id).await?;
        let request = validation_request(scene, &entries, attempts + 1);
        Ok(self.validator.validate(&request).await.unwrap_or_else(|e| {
            warn!(%run_id, error = ?e, "Direct goal validation failed");
            GoalValidation::not_achieved("Goal validation is temporarily unavailable.")
        }))
    }

    /// Handles one chat message for a run.
    #[instrument(skip(self, message), fields(turn_count = tracing::field::Empty))]
    pub async fn handle_turn(
        &self,
        student_id: &str,
        run_id: Uuid,
        scene_id: Option<Uuid>,
        message: &str,
    ) -> SimulationResult<ChatReply> {
        let _guard = self.locks.acquire(run_id).await;

        let mut run = self.load_owned(student_id, run_id).await?;
        let scenario = self.load_scenario(run.scenario_id).await?;
        let now = Utc::now();

        if let Some(requested) = scene_id {
            if scenario.scene_by_id(requested).is_none() {
                return Err(SimulationError::NotFound(format!("scene {}", requested)));
            }
        }
        if run.repair(&scenario, now) {
            warn!(%run_id, "Run state was inconsistent and has been reinitialised");
        }
        if run.is_completed() {
            return Ok(ChatReply::new(&run, prompt::completion_text()));
        }

        let engine = SceneProgression::new(&scenario, self.policy);
        let mut turn_log = TurnLog::default();
        let reply = match (run.status, classify(message)) {
            (_, Some(Command::Begin)) => match engine.begin(&mut run, now) {
                BeginOutcome::Started => self.on_begin(&scenario, &run, &mut turn_log),
                BeginOutcome::AlreadyStarted => {
                    let text = engine
                        .current_scene(&run)
                        .map(prompt::already_started_text)
                        .unwrap_or_else(prompt::completion_text);
                    return Ok(ChatReply::new(&run, text));
                }
            },
            (RunStatus::NotStarted | RunStatus::WaitingForBegin, _) => {
                let text = prompt::waiting_text();
                log_orchestrator(&mut turn_log, &run, &text);
                ChatReply::new(&run, text)
            }
            (_, Some(Command::Help)) => {
                let scene = self.current_scene(&engine, &run)?;
                let text = prompt::help_text(
                    scene,
                    &scenario.scene_personas(scene),
                    run.orchestrator.turn_count,
                );
                log_orchestrator(&mut turn_log, &run, &text);
                ChatReply::new(&run, text)
            }
            (_, Some(Command::Submit)) => {
                if scene_id.is_some() && scene_id != run.current_scene_id {
                    info!(%run_id, "Ignoring submit for a scene that is no longer current");
                    return Ok(ChatReply::new(&run, prompt::duplicate_submit_text()));
                }
                self.on_submit(&engine, &scenario, &mut run, &mut turn_log, now)?
            }
            (_, None) => {
                self.on_message(&engine, &scenario, &mut run, &mut turn_log, student_id, message, now)
                    .await?
            }
        };

        tracing::Span::current().record("turn_count", run.orchestrator.turn_count);
        self.persist(&mut run).await?;
        self.log.append_all(turn_log.entries).await?;
        Ok(reply)
    }

    fn on_begin(&self, scenario: &Scenario, run: &SimulationRun, turn_log: &mut TurnLog) -> ChatReply {
        let text = match scenario.scenes.first() {
            Some(first) => prompt::prologue(scenario, &ScenePayload::build(scenario, 0, first)),
            None => prompt::completion_text(),
        };
        log_orchestrator(turn_log, run, &text);
        ChatReply::new(run, text)
    }

    fn on_submit(
        &self,
        engine: &SceneProgression<'_>,
        scenario: &Scenario,
        run: &mut SimulationRun,
        turn_log: &mut TurnLog,
        now: DateTime<Utc>,
    ) -> SimulationResult<ChatReply> {
        let mut reply = ChatReply::new(run, String::new());
        let transition = engine
            .advance(run, Trigger::Submit, now)
            .context("Submit received for a run that is not in a scene")?;
        reply.apply_transition(run, scenario, &transition);
        log_transition(turn_log, run, &transition, &reply.reply_text);
        Ok(reply)
    }

    async fn on_message(
        &self,
        engine: &SceneProgression<'_>,
        scenario: &Scenario,
        run: &mut SimulationRun,
        turn_log: &mut TurnLog,
        student_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> SimulationResult<ChatReply> {
        let scene = self.current_scene(engine, run)?;
        let prior = self.log.scene_entries(run.id, scene.id).await?;
        let memory = scene_memory(&prior, scene.id);

        turn_log.push(NewLogEntry::user(run.id, scene.id, student_id, message));
        let turn_count = engine.count_turn(run);
        info!(run_id = %run.id, turn_count, "Counted student turn");

        let personas = scenario.scene_personas(scene);
        let mut persona_name = None;
        let mut validate = true;

        let reply_text = match parse_mention(message) {
            Some(mention) => match mention::resolve(&mention.name, &personas) {
                Some(persona) => {
                    let system = prompt::persona_prompt(&self.templates, scenario, scene, persona, &memory);
                    let body = if mention.body.is_empty() {
                        message.to_string()
                    } else {
                        mention.body.clone()
                    };
                    match self.llm.complete(system, vec![PromptMessage::user(body)]).await {
                        Ok(text) => {
                            turn_log.push(NewLogEntry::persona(
                                run.id,
                                scene.id,
                                &persona.id,
                                &persona.name,
                                &text,
                            ));
                            engine.record_response(run);
                            persona_name = Some(persona.name.clone());
                            text
                        }
                        Err(e) => {
                            warn!(persona = %persona.id, error = ?e, "Persona reply failed");
                            let text = prompt::unavailable_text();
                            log_orchestrator(turn_log, run, &text);
                            text
                        }
                    }
                }
                None => {
                    info!(requested = %mention.name, "Mention did not match any persona in scene");
                    validate = false;
                    let text = prompt::redirect_text(&mention.name, &personas);
                    log_orchestrator(turn_log, run, &text);
                    text
                }
            },
            None => {
                let system = prompt::orchestrator_prompt(&self.templates, scenario, scene, &memory);
                let text = match self.llm.complete(system, vec![PromptMessage::user(message)]).await {
                    Ok(text) => {
                        engine.record_response(run);
                        text
                    }
                    Err(e) => {
                        warn!(error = ?e, "Orchestrator reply failed");
                        prompt::redirect_text("anyone", &personas)
                    }
                };
                log_orchestrator(turn_log, run, &text);
                text
            }
        };

        let mut reply = ChatReply::new(run, reply_text);
        reply.persona_name = persona_name;

        let evaluation = if validate && !engine.timed_out(run) {
            let attempts = run.active_record().map_or(0, |r| r.attempts) + 1;
            let entries = turn_log.staged(&prior, scene.id, now);
            let request = validation_request(scene, &entries, attempts);
            engine
                .evaluate_turn(run, self.validator.as_ref(), &request, now)
                .await
        } else {
            TurnEvaluation {
                transition: engine.check_timeout(run, now),
                validation: None,
            }
        };

        if let Some(hint) = evaluation
            .validation
            .as_ref()
            .filter(|v| v.next_action == NextAction::Hint)
            .and_then(|v| v.hint_message.as_deref())
        {
            reply.reply_text = format!("{}\n\nHint: {}", reply.reply_text, hint);
        }
        if let Some(transition) = &evaluation.transition {
            let before = reply.reply_text.len();
            reply.apply_transition(run, scenario, transition);
            let announcement = reply.reply_text[before..].trim_start().to_string();
            log_transition(turn_log, run, transition, &announcement);
        }
        Ok(reply)
    }

    fn current_scene<'s>(
        &self,
        engine: &SceneProgression<'s>,
        run: &SimulationRun,
    ) -> SimulationResult<&'s Scene> {
        engine
            .current_scene(run)
            .with_context(|| format!("run {} has no current scene", run.id))
            .map_err(SimulationError::from)
    }

    async fn persist(&self, run: &mut SimulationRun) -> SimulationResult<()> {
        if !self.runs.save_run(run).await? {
            warn!(run_id = %run.id, version = run.version, "Stale run write rejected");
            return Err(SimulationError::Conflict(run.id));
        }
        run.version += 1;
        Ok(())
    }

    async fn load_owned(&self, student_id: &str, run_id: Uuid) -> SimulationResult<SimulationRun> {
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| SimulationError::NotFound(format!("run {}", run_id)))?;
        if !run.is_owned_by(student_id) {
            warn!(%run_id, "Run requested by a student who does not own it");
            return Err(SimulationError::Unauthorized(run_id));
        }
        Ok(run)
    }

    async fn load_scenario(&self, scenario_id: Uuid) -> SimulationResult<Scenario> {
        self.catalog
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| SimulationError::NotFound(format!("scenario {}", scenario_id)))
    }
}

fn validation_request(scene: &Scene, entries: &[ConversationLogEntry], attempts: u32) -> ValidationRequest {
    let memory = scene_memory(entries, scene.id);
    let last_user_message = memory
        .iter()
        .rev()
        .find(|e| e.message_type == MessageType::User)
        .map(|e| e.content.clone());
    ValidationRequest {
        transcript: format_transcript(&memory),
        last_user_message,
        success_metric: scene.success_metric.clone(),
        user_goal: scene.user_goal.clone(),
        attempts,
        max_attempts: scene.effective_timeout(),
    }
}

fn log_orchestrator(turn_log: &mut TurnLog, run: &SimulationRun, text: &str) {
    if let Some(scene_id) = run.current_scene_id {
        turn_log.push(NewLogEntry::orchestrator(run.id, scene_id, text));
    }
}

/// Logs an announcement in the scene it introduces, or the final scene on completion.
fn log_transition(turn_log: &mut TurnLog, run: &SimulationRun, transition: &Transition, text: &str) {
    let scene_id = match transition {
        Transition::Advanced { to_scene, .. } => *to_scene,
        Transition::Completed { from_scene, .. } => *from_scene,
    };
    turn_log.push(NewLogEntry::orchestrator(run.id, scene_id, text));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::MockGoalValidator;
    use crate::llm_client::MockLLMClient;
    use crate::run::SceneStatus;
    use crate::scenario::fixtures;
    use crate::store::InMemoryStore;
    use futures::executor::block_on;

    struct Harness {
        store: Arc<InMemoryStore>,
        scenario: Scenario,
        orchestrator: ChatOrchestrator,
    }

    fn not_achieved() -> GoalValidation {
        GoalValidation::not_achieved("keep going")
    }

    fn harness(scenario: Scenario, llm: MockLLMClient, validator: MockGoalValidator) -> Harness {
        harness_with_store(Arc::new(InMemoryStore::new()), scenario, llm, validator)
    }

    fn harness_with_store(
        store: Arc<InMemoryStore>,
        scenario: Scenario,
        llm: MockLLMClient,
        validator: MockGoalValidator,
    ) -> Harness {
        store.insert_scenario(scenario.clone());
        let orchestrator = ChatOrchestrator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(llm),
            Arc::new(validator),
            Arc::new(PromptTemplates::default()),
            ValidationPolicy::default(),
        );
        Harness {
            store,
            scenario,
            orchestrator,
        }
    }

    fn chatty_llm() -> MockLLMClient {
        let mut llm = MockLLMClient::new();
        llm.expect_complete().returning(|_, _| Ok("Noted.".to_string()));
        llm
    }

    fn lenient_validator() -> MockGoalValidator {
        let mut validator = MockGoalValidator::new();
        validator.expect_validate().returning(|_| Ok(not_achieved()));
        validator
    }

    async fn started(h: &Harness) -> Uuid {
        let started = h.orchestrator.start_run("s1", h.scenario.id).await.unwrap();
        h.orchestrator
            .handle_turn("s1", started.run.id, None, "begin")
            .await
            .unwrap();
        started.run.id
    }

    #[test]
    fn test_classify_commands() {
        assert_eq!(classify("begin"), Some(Command::Begin));
        assert_eq!(classify("  HELP "), Some(Command::Help));
        assert_eq!(classify("[submit_for_grading]"), Some(Command::Submit));
        assert_eq!(classify("submit"), Some(Command::Submit));
        assert_eq!(classify("let's begin the analysis"), None);
    }

    #[tokio::test]
    async fn test_timeout_scenario_forces_progression_on_third_turn() {
        let mut validator = MockGoalValidator::new();
        validator.expect_validate().times(2).returning(|_| Ok(not_achieved()));
        let h = harness(fixtures::scenario(2, 3), chatty_llm(), validator);
        let run_id = started(&h).await;

        for expected in 1..=2 {
            let reply = h
                .orchestrator
                .handle_turn("s1", run_id, None, "Our margins fell because of rent")
                .await
                .unwrap();
            assert_eq!(reply.turn_count, expected);
            assert!(!reply.scene_completed);
        }
        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "We should renegotiate leases")
            .await
            .unwrap();

        assert!(reply.scene_completed);
        assert_eq!(reply.scene_id, Some(h.scenario.scenes[0].id));
        assert_eq!(reply.next_scene_id, Some(h.scenario.scenes[1].id));
        assert_eq!(reply.turn_count, 0);
        assert!(reply.reply_text.contains("Time is up"));

        let run = h.orchestrator.progress("s1", run_id).await.unwrap();
        let first = run.record_for(h.scenario.scenes[0].id).unwrap();
        assert_eq!(first.status, SceneStatus::Completed);
        assert!(first.forced_progression);
        assert!(!first.goal_achieved);
        assert_eq!(run.orchestrator.turn_count, 0);
        assert_eq!(run.orchestrator.current_scene_index, 1);
    }

    #[tokio::test]
    async fn test_first_name_mention_reaches_persona() {
        let mut llm = MockLLMClient::new();
        llm.expect_complete()
            .withf(|system, history| {
                system.contains("You are Alice Jones") && history[0].content == "hello"
            })
            .times(1)
            .returning(|_, _| Ok("Hello, I'm worried about cash flow.".to_string()));
        let h = harness(fixtures::scenario(2, 5), llm, lenient_validator());
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "@alice hello")
            .await
            .unwrap();

        assert_eq!(reply.persona_name.as_deref(), Some("Alice Jones"));
        assert_eq!(reply.reply_text, "Hello, I'm worried about cash flow.");
        assert_eq!(reply.turn_count, 1);
        let entries = h.store.run_entries(run_id);
        let persona_entry = entries
            .iter()
            .find(|e| e.message_type == MessageType::AiPersona)
            .unwrap();
        assert_eq!(persona_entry.persona_id.as_deref(), Some("alice_jones"));
    }

    #[tokio::test]
    async fn test_submit_on_last_scene_completes_run_without_logging_sentinel() {
        let h = harness(fixtures::scenario(1, 5), chatty_llm(), lenient_validator());
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, Some(h.scenario.scenes[0].id), SUBMIT_SENTINEL)
            .await
            .unwrap();

        assert!(reply.scene_completed);
        assert_eq!(reply.run_status, RunStatus::Completed);
        assert!(reply.next_scene.is_none());
        assert!(reply.reply_text.starts_with("You submitted"));
        assert!(reply.reply_text.contains("completed every scene"));
        let run = h.orchestrator.progress("s1", run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.scene_progress[0].forced_progression);
        assert!(
            h.store
                .run_entries(run_id)
                .iter()
                .all(|e| e.message_type != MessageType::User && !e.content.contains(SUBMIT_SENTINEL))
        );
    }

    #[tokio::test]
    async fn test_second_begin_changes_nothing() {
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), lenient_validator());
        let run_id = started(&h).await;
        h.orchestrator
            .handle_turn("s1", run_id, None, "The numbers look bad")
            .await
            .unwrap();
        let before = h.orchestrator.progress("s1", run_id).await.unwrap();

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "begin")
            .await
            .unwrap();

        assert!(reply.reply_text.contains("already underway"));
        let after = h.orchestrator.progress("s1", run_id).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.orchestrator.turn_count, 1);
        assert_eq!(after.scene_progress.len(), 1);
    }

    #[tokio::test]
    async fn test_help_does_not_count_a_turn() {
        let mut validator = MockGoalValidator::new();
        validator.expect_validate().never();
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), validator);
        let run_id = started(&h).await;

        let reply = h.orchestrator.handle_turn("s1", run_id, None, "help").await.unwrap();
        assert!(reply.reply_text.contains("Turns remaining: 5"));
        assert_eq!(reply.turn_count, 0);
    }

    #[tokio::test]
    async fn test_messages_before_begin_are_not_counted() {
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), lenient_validator());
        let started = h.orchestrator.start_run("s1", h.scenario.id).await.unwrap();

        let reply = h
            .orchestrator
            .handle_turn("s1", started.run.id, None, "What should I do?")
            .await
            .unwrap();
        assert!(reply.reply_text.contains("begin"));
        assert_eq!(reply.run_status, RunStatus::WaitingForBegin);
        assert_eq!(reply.turn_count, 0);
    }

    #[tokio::test]
    async fn test_persona_prompt_only_sees_current_scene() {
        let mut llm = MockLLMClient::new();
        llm.expect_complete()
            .withf(|system, _| !system.contains("You are Alice Jones"))
            .returning(|_, _| Ok("general".to_string()));
        llm.expect_complete()
            .withf(|system, _| {
                system.contains("You are Alice Jones") && !system.contains("confidential scene one plan")
            })
            .times(1)
            .returning(|_, _| Ok("persona".to_string()));
        let h = harness(fixtures::scenario(2, 5), llm, lenient_validator());
        let run_id = started(&h).await;

        h.orchestrator
            .handle_turn("s1", run_id, None, "confidential scene one plan")
            .await
            .unwrap();
        h.orchestrator
            .handle_turn("s1", run_id, None, "submit")
            .await
            .unwrap();
        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "@alice what now?")
            .await
            .unwrap();
        assert_eq!(reply.reply_text, "persona");
        assert_eq!(reply.scene_id, Some(h.scenario.scenes[1].id));
    }

    #[tokio::test]
    async fn test_unknown_mention_counts_turn_but_skips_validation() {
        let mut llm = MockLLMClient::new();
        llm.expect_complete().never();
        let mut validator = MockGoalValidator::new();
        validator.expect_validate().never();
        let h = harness(fixtures::scenario(2, 5), llm, validator);
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "@zed are you there?")
            .await
            .unwrap();
        assert!(reply.reply_text.contains("no one called \"zed\""));
        assert_eq!(reply.turn_count, 1);
        assert!(reply.persona_name.is_none());
    }

    #[tokio::test]
    async fn test_email_address_is_an_ordinary_turn() {
        let mut validator = MockGoalValidator::new();
        validator
            .expect_validate()
            .times(1)
            .returning(|_| Ok(not_achieved()));
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), validator);
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn(
                "s1",
                run_id,
                None,
                "We should close two stores and email the plan to cfo@acme.com by Friday",
            )
            .await
            .unwrap();

        assert_eq!(reply.reply_text, "Noted.");
        assert!(reply.persona_name.is_none());
        assert_eq!(reply.turn_count, 1);
    }

    #[tokio::test]
    async fn test_persona_failure_returns_unavailable_message() {
        let mut llm = MockLLMClient::new();
        llm.expect_complete()
            .returning(|_, _| Err(anyhow::anyhow!("upstream 503")));
        let h = harness(fixtures::scenario(2, 5), llm, lenient_validator());
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "@bob status of the stores?")
            .await
            .unwrap();
        assert_eq!(reply.reply_text, prompt::unavailable_text());
        assert_eq!(reply.turn_count, 1);
    }

    #[tokio::test]
    async fn test_goal_achieved_moves_to_next_scene_with_payload() {
        let mut validator = MockGoalValidator::new();
        validator.expect_validate().returning(|request| {
            assert!(request.transcript.contains("Student: Close two stores"));
            Ok(GoalValidation {
                goal_achieved: true,
                confidence_score: 0.9,
                reasoning: "Clear plan".to_string(),
                next_action: NextAction::Progress,
                hint_message: None,
            })
        });
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), validator);
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "Close two stores and renegotiate rent")
            .await
            .unwrap();

        assert!(reply.scene_completed);
        assert!(reply.reply_text.starts_with("Noted."));
        assert!(reply.reply_text.contains("Well done"));
        let next = reply.next_scene.unwrap();
        assert_eq!(next.index, 1);
        assert!(next.personas.iter().all(|p| p.id != "sam_rivera"));
    }

    #[tokio::test]
    async fn test_hint_is_appended_to_reply() {
        let mut validator = MockGoalValidator::new();
        validator.expect_validate().returning(|_| {
            Ok(GoalValidation {
                next_action: NextAction::Hint,
                hint_message: Some("Ask Alice about the cash runway.".to_string()),
                ..not_achieved()
            })
        });
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), validator);
        let run_id = started(&h).await;

        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, None, "I am not sure where to start")
            .await
            .unwrap();
        assert!(reply.reply_text.ends_with("Hint: Ask Alice about the cash runway."));
    }

    #[tokio::test]
    async fn test_stale_submit_is_ignored() {
        let h = harness(fixtures::scenario(3, 5), chatty_llm(), lenient_validator());
        let run_id = started(&h).await;
        let first_scene = h.scenario.scenes[0].id;

        h.orchestrator
            .handle_turn("s1", run_id, Some(first_scene), "submit")
            .await
            .unwrap();
        let reply = h
            .orchestrator
            .handle_turn("s1", run_id, Some(first_scene), "submit")
            .await
            .unwrap();

        assert!(!reply.scene_completed);
        let run = h.orchestrator.progress("s1", run_id).await.unwrap();
        assert_eq!(run.orchestrator.current_scene_index, 1);
        assert_eq!(run.completed_scene_ids, vec![first_scene]);
    }

    #[tokio::test]
    async fn test_other_students_are_rejected() {
        let h = harness(fixtures::scenario(1, 5), chatty_llm(), lenient_validator());
        let run_id = started(&h).await;

        assert!(matches!(
            h.orchestrator.handle_turn("intruder", run_id, None, "hi").await,
            Err(SimulationError::Unauthorized(_))
        ));
        assert!(matches!(
            h.orchestrator.progress("intruder", run_id).await,
            Err(SimulationError::Unauthorized(_))
        ));
        assert!(matches!(
            h.orchestrator.progress("s1", Uuid::new_v4()).await,
            Err(SimulationError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.handle_turn("s1", run_id, Some(Uuid::new_v4()), "hi").await,
            Err(SimulationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_run_replaces_previous_attempt() {
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), lenient_validator());
        let first = started(&h).await;

        let second = h.orchestrator.start_run("s1", h.scenario.id).await.unwrap();

        assert_ne!(first, second.run.id);
        assert_eq!(second.run.status, RunStatus::WaitingForBegin);
        assert_eq!(second.scenario.scene_count, 2);
        assert_eq!(second.first_scene.unwrap().scene_id, h.scenario.scenes[0].id);
        assert!(matches!(
            h.orchestrator.progress("s1", first).await,
            Err(SimulationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_turns_are_serialised() {
        let h = harness(fixtures::scenario(2, 10), chatty_llm(), lenient_validator());
        let run_id = started(&h).await;
        let orchestrator = Arc::new(h.orchestrator);

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .handle_turn("s1", run_id, None, &format!("Idea number {}", i))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let run = orchestrator.progress("s1", run_id).await.unwrap();
        assert_eq!(run.orchestrator.turn_count, 4);
        assert_eq!(run.active_record().unwrap().user_messages, 4);
    }

    #[tokio::test]
    async fn test_conflicting_turn_leaves_log_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let active_run: Arc<Mutex<Option<Uuid>>> = Arc::default();
        let mut validator = MockGoalValidator::new();
        {
            let store = store.clone();
            let active_run = active_run.clone();
            validator.expect_validate().returning(move |_| {
                // Another writer saves the run while this turn is still in flight.
                let run_id = active_run.lock().unwrap().as_ref().copied().unwrap();
                let run = block_on(store.get_run(run_id)).unwrap().unwrap();
                assert!(block_on(store.save_run(&run)).unwrap());
                Ok(not_achieved())
            });
        }
        let h = harness_with_store(store, fixtures::scenario(2, 5), chatty_llm(), validator);
        let run_id = started(&h).await;
        *active_run.lock().unwrap() = Some(run_id);
        let logged_before = h.store.run_entries(run_id);

        let result = h
            .orchestrator
            .handle_turn("s1", run_id, None, "We should close two stores")
            .await;

        assert!(matches!(result, Err(SimulationError::Conflict(id)) if id == run_id));
        assert_eq!(h.store.run_entries(run_id), logged_before);
        let run = h.orchestrator.progress("s1", run_id).await.unwrap();
        assert_eq!(run.orchestrator.turn_count, 0);
    }

    #[tokio::test]
    async fn test_turn_entries_are_logged_in_order_after_save() {
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), lenient_validator());
        let run_id = started(&h).await;

        h.orchestrator
            .handle_turn("s1", run_id, None, "Rent is the main cost driver")
            .await
            .unwrap();

        let entries = h.store.run_entries(run_id);
        let tail: Vec<_> = entries
            .iter()
            .rev()
            .take(2)
            .rev()
            .map(|e| (e.message_type, e.content.as_str()))
            .collect();
        assert_eq!(
            tail,
            vec![
                (MessageType::User, "Rent is the main cost driver"),
                (MessageType::Orchestrator, "Noted."),
            ]
        );
        assert!(entries.windows(2).all(|w| w[0].order_index < w[1].order_index));
    }

    #[tokio::test]
    async fn test_direct_validation_does_not_mutate_run() {
        let mut validator = MockGoalValidator::new();
        validator
            .expect_validate()
            .returning(|_| Err(anyhow::anyhow!("timeout")));
        let h = harness(fixtures::scenario(2, 5), chatty_llm(), validator);
        let run_id = started(&h).await;
        let before = h.orchestrator.progress("s1", run_id).await.unwrap();

        let verdict = h
            .orchestrator
            .validate_goal("s1", run_id, h.scenario.scenes[0].id)
            .await
            .unwrap();

        assert!(!verdict.goal_achieved);
        assert_eq!(h.orchestrator.progress("s1", run_id).await.unwrap(), before);
    }
}
