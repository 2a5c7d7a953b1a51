//! Scenario Catalog Types
//!
//! Scenarios, scenes and personas are authored by professors and read by the
//! simulation runtime. Nothing in this module mutates them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scene length cap used when a scene is authored without one.
pub const DEFAULT_TIMEOUT_TURNS: u32 = 15;

/// Voice guidance bucket for a persona, chosen when the persona is authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaArchetype {
    Executive,
    Investor,
    Customer,
    Employee,
    Advisor,
    #[default]
    Generic,
}

impl PersonaArchetype {
    /// Parses a stored tag, falling back to `Generic` for anything unknown.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "executive" => Self::Executive,
            "investor" => Self::Investor,
            "customer" => Self::Customer,
            "employee" => Self::Employee,
            "advisor" => Self::Advisor,
            _ => Self::Generic,
        }
    }

    /// How a persona of this archetype should sound.
    pub fn voice_guidance(&self) -> &'static str {
        match self {
            Self::Executive => {
                "Speak like a senior leader: decisive, focused on strategy, priorities and accountability."
            }
            Self::Investor => {
                "Speak like an investor: probe the numbers, question risk and expect a clear return."
            }
            Self::Customer => {
                "Speak like a customer: describe your needs and frustrations concretely and react to proposals honestly."
            }
            Self::Employee => {
                "Speak like a team member: share operational detail, raise practical concerns and ask for direction."
            }
            Self::Advisor => {
                "Speak like an experienced advisor: ask guiding questions rather than handing over answers."
            }
            Self::Generic => {
                "Stay in character and respond the way a real business professional in your role would."
            }
        }
    }
}

/// An AI-voiced character that can appear in one or more scenes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Persona {
    /// Stable slug such as `alice_jones`.
    pub id: String,
    pub name: String,
    pub role: String,
    pub background: String,
    pub personality_traits: Vec<String>,
    pub goals: String,
    #[serde(default)]
    pub archetype: PersonaArchetype,
}

impl Persona {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// One ordered stage of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scene {
    pub id: Uuid,
    /// 1-based position as authored.
    pub scene_order: u32,
    pub title: String,
    pub description: String,
    pub user_goal: String,
    /// Primary criterion for goal validation and grading.
    pub success_metric: String,
    pub timeout_turns: u32,
    pub persona_ids: Vec<String>,
}

impl Scene {
    /// Timeout with the default applied for scenes authored without one.
    pub fn effective_timeout(&self) -> u32 {
        if self.timeout_turns == 0 {
            DEFAULT_TIMEOUT_TURNS
        } else {
            self.timeout_turns
        }
    }
}

/// A complete business case: its framing, ordered scenes and persona roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub challenge: String,
    /// The role the student plays; a persona with this name is never voiced by the AI.
    pub student_role: String,
    /// Ordered by `scene_order`.
    pub scenes: Vec<Scene>,
    pub personas: Vec<Persona>,
}

impl Scenario {
    pub fn scene_at(&self, index: usize) -> Option<&Scene> {
        self.scenes.get(index)
    }

    pub fn scene_by_id(&self, scene_id: Uuid) -> Option<(usize, &Scene)> {
        self.scenes.iter().enumerate().find(|(_, s)| s.id == scene_id)
    }

    pub fn persona(&self, persona_id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == persona_id)
    }

    /// Personas the AI may voice in `scene`, with the student's own role removed.
    pub fn scene_personas(&self, scene: &Scene) -> Vec<&Persona> {
        let student_role = self.student_role.trim().to_lowercase();
        scene
            .persona_ids
            .iter()
            .filter_map(|id| self.persona(id))
            .filter(|p| student_role.is_empty() || p.name.trim().to_lowercase() != student_role)
            .collect()
    }

    /// Puts scenes in authored order. Catalog readers call this after loading.
    pub fn sort_scenes(&mut self) {
        self.scenes.sort_by_key(|s| s.scene_order);
    }
}

/// What a client needs to render a scene.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenePayload {
    pub scene_id: Uuid,
    pub index: usize,
    pub title: String,
    pub description: String,
    pub objectives: String,
    pub timeout_turns: u32,
    pub personas: Vec<PersonaSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonaSummary {
    pub id: String,
    pub name: String,
    pub role: String,
}

impl ScenePayload {
    pub fn build(scenario: &Scenario, index: usize, scene: &Scene) -> Self {
        Self {
            scene_id: scene.id,
            index,
            title: scene.title.clone(),
            description: scene.description.clone(),
            objectives: scene.user_goal.clone(),
            timeout_turns: scene.effective_timeout(),
            personas: scenario
                .scene_personas(scene)
                .into_iter()
                .map(|p| PersonaSummary {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    role: p.role.clone(),
                })
                .collect(),
        }
    }
}

/// Header information for a scenario, without scenes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioSummary {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub challenge: String,
    pub student_role: String,
    pub scene_count: usize,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(scenario: &Scenario) -> Self {
        Self {
            id: scenario.id,
            title: scenario.title.clone(),
            description: scenario.description.clone(),
            challenge: scenario.challenge.clone(),
            student_role: scenario.student_role.clone(),
            scene_count: scenario.scenes.len(),
        }
    }
}
