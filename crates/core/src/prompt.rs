//! Prompt Assembly
//!
//! Plain string templates with `{placeholder}` substitution. Nothing here
//! touches run state; callers pass in exactly the log entries a prompt may see.

use std::collections::HashMap;
use uuid::Uuid;

use crate::goal::ValidationRequest;
use crate::progression::Trigger;
use crate::run::{ConversationLogEntry, MessageType};
use crate::scenario::{Persona, Scenario, Scene, ScenePayload};

/// The markdown templates used to talk to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplates {
    pub persona: String,
    pub orchestrator: String,
    pub goal_validation: String,
    pub grading: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            persona: include_str!("../prompts/persona.md").to_string(),
            orchestrator: include_str!("../prompts/orchestrator.md").to_string(),
            goal_validation: include_str!("../prompts/goal_validation.md").to_string(),
            grading: include_str!("../prompts/grading.md").to_string(),
        }
    }
}

impl PromptTemplates {
    /// Built-in templates with any entry of `prompts` (keyed by file stem) taking precedence.
    pub fn with_overrides(prompts: &HashMap<String, String>) -> Self {
        let mut templates = Self::default();
        let slots = [
            ("persona", &mut templates.persona),
            ("orchestrator", &mut templates.orchestrator),
            ("goal_validation", &mut templates.goal_validation),
            ("grading", &mut templates.grading),
        ];
        for (key, slot) in slots {
            if let Some(custom) = prompts.get(key) {
                *slot = custom.clone();
            }
        }
        templates
    }
}

fn render(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Entries that belong to `scene_id`. Prompts are only ever built from this.
pub fn scene_memory(entries: &[ConversationLogEntry], scene_id: Uuid) -> Vec<&ConversationLogEntry> {
    entries
        .iter()
        .filter(|e| e.scene_id == scene_id && e.message_type != MessageType::Orchestrator)
        .collect()
}

pub fn format_transcript(entries: &[&ConversationLogEntry]) -> String {
    if entries.is_empty() {
        return "(nothing yet)".to_string();
    }
    entries
        .iter()
        .map(|e| match e.message_type {
            MessageType::User => format!("Student: {}", e.content),
            _ => format!("{}: {}", e.sender_name, e.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn persona_list(personas: &[&Persona]) -> String {
    if personas.is_empty() {
        return "(no one else is present)".to_string();
    }
    personas
        .iter()
        .map(|p| format!("- {} (@{}), {}", p.name, p.id, p.role))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn persona_prompt(
    templates: &PromptTemplates,
    scenario: &Scenario,
    scene: &Scene,
    persona: &Persona,
    memory: &[&ConversationLogEntry],
) -> String {
    let personality = if persona.personality_traits.is_empty() {
        "Professional.".to_string()
    } else {
        persona.personality_traits.join(", ")
    };
    render(
        &templates.persona,
        &[
            ("persona_name", &persona.name),
            ("persona_role", &persona.role),
            ("scenario_title", &scenario.title),
            ("background", &persona.background),
            ("goals", &persona.goals),
            ("personality", &personality),
            ("voice", persona.archetype.voice_guidance()),
            ("scene_title", &scene.title),
            ("scene_description", &scene.description),
            ("student_role", &scenario.student_role),
            ("memory", &format_transcript(memory)),
        ],
    )
}

pub fn orchestrator_prompt(
    templates: &PromptTemplates,
    scenario: &Scenario,
    scene: &Scene,
    memory: &[&ConversationLogEntry],
) -> String {
    render(
        &templates.orchestrator,
        &[
            ("scenario_title", &scenario.title),
            ("student_role", &scenario.student_role),
            ("scene_title", &scene.title),
            ("scene_description", &scene.description),
            ("user_goal", &scene.user_goal),
            ("persona_list", &persona_list(&scenario.scene_personas(scene))),
            ("memory", &format_transcript(memory)),
        ],
    )
}

pub fn goal_validation_prompt(templates: &PromptTemplates, request: &ValidationRequest) -> String {
    render(
        &templates.goal_validation,
        &[
            ("success_metric", &request.success_metric),
            ("user_goal", &request.user_goal),
            ("attempts", &request.attempts.to_string()),
            ("max_attempts", &request.max_attempts.to_string()),
            ("transcript", &request.transcript),
        ],
    )
}

pub fn grading_prompt(templates: &PromptTemplates, scene: &Scene, user_messages: &[String]) -> String {
    let messages = user_messages
        .iter()
        .enumerate()
        .map(|(i, m)| format!("{}. {}", i + 1, m))
        .collect::<Vec<_>>()
        .join("\n");
    render(
        &templates.grading,
        &[
            ("scene_title", &scene.title),
            ("success_metric", &scene.success_metric),
            ("user_goal", &scene.user_goal),
            ("messages", &messages),
        ],
    )
}

// --- Fixed orchestrator texts ---

pub fn welcome_text(scenario: &Scenario) -> String {
    format!(
        "Welcome to \"{}\". You will play {}. Type \"begin\" when you are ready to start.",
        scenario.title, scenario.student_role
    )
}

pub fn waiting_text() -> String {
    "The simulation has not started yet. Type \"begin\" when you are ready.".to_string()
}

pub fn scene_intro(payload: &ScenePayload) -> String {
    let roster = if payload.personas.is_empty() {
        "No one else is in this scene.".to_string()
    } else {
        payload
            .personas
            .iter()
            .map(|p| format!("- {} (@{}), {}", p.name, p.id, p.role))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Scene {}: {}\n{}\n\nObjective: {}\nYou have {} turns.\n\nPeople in this scene:\n{}",
        payload.index + 1,
        payload.title,
        payload.description,
        payload.objectives,
        payload.timeout_turns,
        roster
    )
}

pub fn prologue(scenario: &Scenario, first_scene: &ScenePayload) -> String {
    format!(
        "{}\n\n{}\n\nYour challenge: {}\n\n{}\n\nAddress someone with @name, type \"help\" for guidance, or \"submit\" to move on.",
        scenario.title,
        scenario.description,
        scenario.challenge,
        scene_intro(first_scene)
    )
}

pub fn already_started_text(scene: &Scene) -> String {
    format!(
        "The simulation is already underway. You are in \"{}\". Type \"help\" if you need a reminder.",
        scene.title
    )
}

pub fn help_text(scene: &Scene, personas: &[&Persona], turn_count: u32) -> String {
    let remaining = scene.effective_timeout().saturating_sub(turn_count);
    format!(
        "Current scene: {}\nGoal: {}\nTurns remaining: {}\n\nPeople you can talk to:\n{}\n\nCommands:\n- @name <message>: speak to a character\n- help: show this message\n- submit: finish this scene and move on",
        scene.title,
        scene.user_goal,
        remaining,
        persona_list(personas)
    )
}

pub fn redirect_text(requested: &str, personas: &[&Persona]) -> String {
    format!(
        "There is no one called \"{}\" in this scene. You can talk to:\n{}",
        requested,
        persona_list(personas)
    )
}

pub fn unavailable_text() -> String {
    "That character is temporarily unavailable. Please try again in a moment.".to_string()
}

pub fn transition_text(completed_title: &str, trigger: Trigger, next: Option<&ScenePayload>) -> String {
    let lead = match trigger {
        Trigger::GoalAchieved => format!("Well done, you completed \"{}\".", completed_title),
        Trigger::Timeout => format!("Time is up for \"{}\". Moving on.", completed_title),
        Trigger::Submit => format!("You submitted \"{}\".", completed_title),
    };
    match next {
        Some(payload) => format!("{}\n\n{}", lead, scene_intro(payload)),
        None => format!("{}\n\n{}", lead, completion_text()),
    }
}

pub fn completion_text() -> String {
    "You have completed every scene of this simulation. Your work is ready for grading.".to_string()
}

pub fn duplicate_submit_text() -> String {
    "That scene has already been submitted.".to_string()
}
