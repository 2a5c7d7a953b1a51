//! Scene Progression Engine
//!
//! Drives a run through `not_started → waiting_for_begin → in_progress(0..n) →
//! completed`. The engine mutates the run it is handed and nothing else; the
//! caller persists the result.
//!
//! After every counted turn the engine checks the scene's turn budget first
//! and only consults the goal validator when the budget is not exhausted.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::goal::{GoalValidation, GoalValidator, ValidationPolicy, ValidationRequest};
use crate::run::{RunStatus, SceneProgressRecord, SceneStatus, SimulationRun};
use crate::scenario::{Scenario, Scene};

/// Why a scene ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    GoalAchieved,
    Timeout,
    Submit,
}

impl Trigger {
    pub fn is_forced(&self) -> bool {
        matches!(self, Trigger::Timeout | Trigger::Submit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    AlreadyStarted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Advanced {
        from_scene: Uuid,
        to_scene: Uuid,
        to_index: usize,
        trigger: Trigger,
    },
    Completed {
        from_scene: Uuid,
        trigger: Trigger,
        final_score: Option<f64>,
    },
}

impl Transition {
    pub fn from_scene(&self) -> Uuid {
        match self {
            Transition::Advanced { from_scene, .. } | Transition::Completed { from_scene, .. } => {
                *from_scene
            }
        }
    }

    pub fn trigger(&self) -> Trigger {
        match self {
            Transition::Advanced { trigger, .. } | Transition::Completed { trigger, .. } => *trigger,
        }
    }
}

/// What happened when a counted turn was evaluated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnEvaluation {
    pub transition: Option<Transition>,
    /// `None` when the validator was not consulted.
    pub validation: Option<GoalValidation>,
}

/// Mean of the scores that exist. Ungraded scenes are skipped, not counted as zero.
pub fn final_score<I>(scores: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = scores
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), s| (sum + s, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// The state machine for one scenario.
pub struct SceneProgression<'a> {
    scenario: &'a Scenario,
    policy: ValidationPolicy,
}

impl<'a> SceneProgression<'a> {
    pub fn new(scenario: &'a Scenario, policy: ValidationPolicy) -> Self {
        Self { scenario, policy }
    }

    pub fn current_scene(&self, run: &SimulationRun) -> Option<&'a Scene> {
        self.scenario.scene_at(run.orchestrator.current_scene_index)
    }

    /// Starts scene 0. A second call is a no-op.
    pub fn begin(&self, run: &mut SimulationRun, now: DateTime<Utc>) -> BeginOutcome {
        if !matches!(run.status, RunStatus::NotStarted | RunStatus::WaitingForBegin) {
            return BeginOutcome::AlreadyStarted;
        }

        run.orchestrator.simulation_started = true;
        run.orchestrator.user_ready = true;
        run.orchestrator.current_scene_index = 0;
        run.orchestrator.turn_count = 0;
        run.updated_at = now;

        let Some(first) = self.scenario.scenes.first() else {
            run.status = RunStatus::Completed;
            run.completed_at = Some(now);
            return BeginOutcome::Started;
        };
        run.status = RunStatus::InProgress;
        run.current_scene_id = Some(first.id);
        if run.active_record().map(|r| r.scene_id) != Some(first.id) {
            run.scene_progress.push(SceneProgressRecord::start(first.id, now));
        }
        info!(run_id = %run.id, scene_id = %first.id, "Simulation started");
        BeginOutcome::Started
    }

    /// Counts one student turn in the current scene and returns the new count.
    pub fn count_turn(&self, run: &mut SimulationRun) -> u32 {
        run.orchestrator.turn_count += 1;
        if let Some(record) = run.active_record_mut() {
            record.user_messages += 1;
        }
        run.orchestrator.turn_count
    }

    pub fn record_response(&self, run: &mut SimulationRun) {
        if let Some(record) = run.active_record_mut() {
            record.ai_responses += 1;
        }
    }

    pub fn timed_out(&self, run: &SimulationRun) -> bool {
        self.current_scene(run)
            .is_some_and(|scene| run.orchestrator.turn_count >= scene.effective_timeout())
    }

    /// Leaves the current scene. Returns `None` if the run is not in a scene.
    pub fn advance(
        &self,
        run: &mut SimulationRun,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if run.status != RunStatus::InProgress {
            return None;
        }
        let index = run.orchestrator.current_scene_index;
        let outgoing = self.current_scene(run)?;

        match run.active_record_mut() {
            Some(record) => {
                record.status = SceneStatus::Completed;
                record.forced_progression = trigger.is_forced();
                record.completed_at = Some(now);
            }
            None => {
                let mut record = SceneProgressRecord::start(outgoing.id, now);
                record.status = SceneStatus::Completed;
                record.forced_progression = trigger.is_forced();
                record.completed_at = Some(now);
                run.scene_progress.push(record);
            }
        }
        if trigger.is_forced() {
            run.forced_progressions += 1;
        }
        if !run.completed_scene_ids.contains(&outgoing.id) {
            run.completed_scene_ids.push(outgoing.id);
        }
        run.orchestrator.turn_count = 0;
        run.updated_at = now;

        let transition = match self.scenario.scene_at(index + 1) {
            Some(next) => {
                run.orchestrator.current_scene_index = index + 1;
                run.current_scene_id = Some(next.id);
                run.scene_progress.push(SceneProgressRecord::start(next.id, now));
                Transition::Advanced {
                    from_scene: outgoing.id,
                    to_scene: next.id,
                    to_index: index + 1,
                    trigger,
                }
            }
            None => {
                let score = final_score(run.scene_progress.iter().map(|r| r.achievement_score));
                run.status = RunStatus::Completed;
                run.completed_at = Some(now);
                run.final_score = score;
                Transition::Completed {
                    from_scene: outgoing.id,
                    trigger,
                    final_score: score,
                }
            }
        };
        info!(run_id = %run.id, ?trigger, ?transition, "Scene transition");
        Some(transition)
    }

    /// Forces a transition if the turn budget is spent, without consulting anyone.
    pub fn check_timeout(&self, run: &mut SimulationRun, now: DateTime<Utc>) -> Option<Transition> {
        if self.timed_out(run) {
            info!(run_id = %run.id, turn_count = run.orchestrator.turn_count, "Scene turn budget exhausted");
            self.advance(run, Trigger::Timeout, now)
        } else {
            None
        }
    }

    /// Decides the outcome of a counted turn: timeout first, then the validator.
    pub async fn evaluate_turn(
        &self,
        run: &mut SimulationRun,
        validator: &dyn GoalValidator,
        request: &ValidationRequest,
        now: DateTime<Utc>,
    ) -> TurnEvaluation {
        if let Some(transition) = self.check_timeout(run, now) {
            return TurnEvaluation {
                transition: Some(transition),
                validation: None,
            };
        }
        if run.status != RunStatus::InProgress {
            return TurnEvaluation::default();
        }

        if let Some(record) = run.active_record_mut() {
            record.attempts += 1;
        }
        let verdict = match validator.validate(request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(run_id = %run.id, error = ?e, "Goal validation failed; continuing scene");
                GoalValidation::not_achieved("Goal validation was unavailable for this turn.")
            }
        };

        let transition = if self.policy.accepts(&verdict) {
            if let Some(record) = run.active_record_mut() {
                record.goal_achieved = true;
                record.achievement_score = Some(verdict.confidence_score * 100.0);
            }
            self.advance(run, Trigger::GoalAchieved, now)
        } else {
            None
        };

        TurnEvaluation {
            transition,
            validation: Some(verdict),
        }
    }
}
