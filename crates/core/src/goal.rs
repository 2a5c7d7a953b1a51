//! Goal Validation
//!
//! Decides whether the student has met a scene's success metric. The model is
//! forced to answer through a single function whose parameters are generated
//! from [`GoalValidation`], so the reply never needs free-text parsing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::llm_client::{FunctionSpec, LLMClient, PromptMessage};
use crate::prompt::{self, PromptTemplates};

pub const GOAL_FUNCTION_NAME: &str = "report_goal_validation";

/// Last messages that are never worth sending to the model.
const STOPLIST: &[&str] = &[
    "test", "hi", "hello", "ok", "okay", "yes", "no", "hey", "k", "lol",
];
const MIN_MESSAGE_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    #[default]
    Continue,
    Progress,
    Hint,
    ForceProgress,
}

/// The model's verdict on the current scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GoalValidation {
    /// Whether the success metric has been met.
    pub goal_achieved: bool,
    /// Confidence in the verdict, from 0.0 to 1.0.
    pub confidence_score: f64,
    /// One or two sentences explaining the verdict.
    pub reasoning: String,
    /// What the simulation should do next.
    pub next_action: NextAction,
    /// A short nudge for the student when `next_action` is "hint".
    #[serde(default)]
    pub hint_message: Option<String>,
}

impl GoalValidation {
    /// The verdict used whenever validation could not run.
    pub fn not_achieved(reasoning: impl Into<String>) -> Self {
        Self {
            goal_achieved: false,
            confidence_score: 0.0,
            reasoning: reasoning.into(),
            next_action: NextAction::Continue,
            hint_message: None,
        }
    }

    fn clamped(mut self) -> Self {
        self.confidence_score = if self.confidence_score.is_finite() {
            self.confidence_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Everything a validator may look at for one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRequest {
    /// In-scene transcript only.
    pub transcript: String,
    pub last_user_message: Option<String>,
    pub success_metric: String,
    pub user_goal: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Accept/reject boundary applied on top of the model's verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationPolicy {
    pub min_confidence: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self { min_confidence: 0.0 }
    }
}

impl ValidationPolicy {
    /// True when the verdict should move the run to the next scene.
    pub fn accepts(&self, verdict: &GoalValidation) -> bool {
        let confident = verdict.goal_achieved && verdict.confidence_score >= self.min_confidence;
        confident
            || matches!(
                verdict.next_action,
                NextAction::Progress | NextAction::ForceProgress
            )
    }
}

/// Returns the canned verdict for degenerate input, or `None` if the message deserves a real check.
pub fn prefilter(last_user_message: Option<&str>) -> Option<GoalValidation> {
    let message = last_user_message.map(str::trim).unwrap_or_default();
    let lowered = message.to_lowercase();
    if message.chars().count() < MIN_MESSAGE_CHARS || STOPLIST.contains(&lowered.as_str()) {
        return Some(GoalValidation::not_achieved(
            "Your last message does not address the scene goal yet. Engage with the objective to make progress.",
        ));
    }
    None
}

/// Judges a scene transcript against its success metric.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GoalValidator: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> Result<GoalValidation>;
}

/// Goal validator backed by a forced function call on the LLM gateway.
pub struct LLMGoalValidator {
    llm: Arc<dyn LLMClient>,
    templates: Arc<PromptTemplates>,
}

impl LLMGoalValidator {
    pub fn new(llm: Arc<dyn LLMClient>, templates: Arc<PromptTemplates>) -> Self {
        Self { llm, templates }
    }

    pub fn function_spec() -> Result<FunctionSpec> {
        let mut parameters = serde_json::to_value(schemars::schema_for!(GoalValidation))?;
        if let Some(obj) = parameters.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }
        Ok(FunctionSpec {
            name: GOAL_FUNCTION_NAME.to_string(),
            description: "Report whether the student has achieved the scene's success metric."
                .to_string(),
            parameters,
        })
    }
}

#[async_trait]
impl GoalValidator for LLMGoalValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<GoalValidation> {
        if let Some(canned) = prefilter(request.last_user_message.as_deref()) {
            debug!("Skipping goal validation for degenerate message");
            return Ok(canned);
        }

        let system_prompt = prompt::goal_validation_prompt(&self.templates, request);
        let arguments = self
            .llm
            .call_function(
                system_prompt,
                vec![PromptMessage::user(
                    "Assess the transcript above and report your verdict.",
                )],
                Self::function_spec()?,
            )
            .await?;

        let verdict: GoalValidation = serde_json::from_value(arguments)
            .context("Goal validation output did not match the expected shape")?;
        let verdict = verdict.clamped();
        info!(
            goal_achieved = verdict.goal_achieved,
            confidence = verdict.confidence_score,
            next_action = ?verdict.next_action,
            "Goal validation complete"
        );
        Ok(verdict)
    }
}
