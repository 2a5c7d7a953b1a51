//! Grading Pipeline
//!
//! A read-only pass over a run that scores each scene's student messages
//! against the scene's success metric and rolls them up into a report.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{SimulationError, SimulationResult};
use crate::llm_client::{LLMClient, PromptMessage, extract_json_object};
use crate::prompt::{self, PromptTemplates};
use crate::run::{MessageType, SimulationRun};
use crate::scenario::Scene;
use crate::store::{ConversationLog, RunStore, ScenarioCatalog};

const NO_MESSAGES_FEEDBACK: &str = "No responses were recorded for this scene.";
const FALLBACK_FEEDBACK: &str = "Automated feedback is unavailable for this scene.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneGrade {
    pub scene_id: Uuid,
    pub title: String,
    pub score: Option<f64>,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeReport {
    pub run_id: Uuid,
    pub overall_score: Option<f64>,
    pub overall_feedback: String,
    pub per_scene: Vec<SceneGrade>,
}

#[derive(Debug, Deserialize)]
struct GradeOutput {
    score: f64,
    #[serde(default)]
    feedback: String,
}

/// Mean of the scenes that have a score. With `weights`, a weighted mean where
/// scenes missing from the map weigh 1.0.
pub fn overall_score(grades: &[SceneGrade], weights: Option<&HashMap<Uuid, f64>>) -> Option<f64> {
    let (sum, total) = grades
        .iter()
        .filter_map(|g| {
            let weight = weights
                .and_then(|w| w.get(&g.scene_id).copied())
                .unwrap_or(1.0)
                .max(0.0);
            g.score.map(|score| (score * weight, weight))
        })
        .fold((0.0, 0.0), |(sum, total), (s, w)| (sum + s, total + w));
    (total > 0.0).then(|| sum / total)
}

fn overall_feedback(grades: &[SceneGrade]) -> String {
    let scored: Vec<(&SceneGrade, f64)> = grades
        .iter()
        .filter_map(|g| g.score.map(|s| (g, s)))
        .collect();
    if scored.is_empty() {
        return "No scenes could be graded for this run.".to_string();
    }

    let mut lines = vec![format!("Graded {} of {} scenes.", scored.len(), grades.len())];
    let best = scored.iter().max_by(|a, b| a.1.total_cmp(&b.1));
    let worst = scored.iter().min_by(|a, b| a.1.total_cmp(&b.1));
    if let (Some((best, best_score)), Some((worst, worst_score))) = (best, worst) {
        lines.push(format!("Strongest scene: \"{}\" ({:.0}).", best.title, best_score));
        if best.scene_id != worst.scene_id {
            lines.push(format!("Most room to improve: \"{}\" ({:.0}).", worst.title, worst_score));
        }
    }
    lines.join(" ")
}

pub struct Grader {
    runs: Arc<dyn RunStore>,
    catalog: Arc<dyn ScenarioCatalog>,
    log: Arc<dyn ConversationLog>,
    llm: Arc<dyn LLMClient>,
    templates: Arc<PromptTemplates>,
}

impl Grader {
    pub fn new(
        runs: Arc<dyn RunStore>,
        catalog: Arc<dyn ScenarioCatalog>,
        log: Arc<dyn ConversationLog>,
        llm: Arc<dyn LLMClient>,
        templates: Arc<PromptTemplates>,
    ) -> Self {
        Self {
            runs,
            catalog,
            log,
            llm,
            templates,
        }
    }

    #[instrument(skip(self, weights))]
    pub async fn grade(
        &self,
        student_id: &str,
        run_id: Uuid,
        weights: Option<&HashMap<Uuid, f64>>,
    ) -> SimulationResult<GradeReport> {
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| SimulationError::NotFound(format!("run {}", run_id)))?;
        if !run.is_owned_by(student_id) {
            return Err(SimulationError::Unauthorized(run_id));
        }
        let scenario = self
            .catalog
            .get_scenario(run.scenario_id)
            .await?
            .ok_or_else(|| SimulationError::NotFound(format!("scenario {}", run.scenario_id)))?;

        let grades = join_all(scenario.scenes.iter().map(|scene| self.grade_scene(&run, scene))).await;
        let per_scene = grades.into_iter().collect::<SimulationResult<Vec<_>>>()?;

        let report = GradeReport {
            run_id,
            overall_score: overall_score(&per_scene, weights),
            overall_feedback: overall_feedback(&per_scene),
            per_scene,
        };
        info!(%run_id, overall_score = ?report.overall_score, "Run graded");
        Ok(report)
    }

    async fn grade_scene(&self, run: &SimulationRun, scene: &Scene) -> SimulationResult<SceneGrade> {
        let stored = run.record_for(scene.id).and_then(|r| r.achievement_score);
        let messages: Vec<String> = self
            .log
            .scene_entries(run.id, scene.id)
            .await?
            .into_iter()
            .filter(|e| e.message_type == MessageType::User)
            .map(|e| e.content)
            .collect();

        let mut grade = SceneGrade {
            scene_id: scene.id,
            title: scene.title.clone(),
            score: stored,
            feedback: NO_MESSAGES_FEEDBACK.to_string(),
        };
        if messages.is_empty() {
            return Ok(grade);
        }

        let system = prompt::grading_prompt(&self.templates, scene, &messages);
        let reply = self
            .llm
            .complete(system, vec![PromptMessage::user("Grade the student's responses.")])
            .await;
        let parsed = reply.map(|text| {
            extract_json_object(&text).and_then(|v| serde_json::from_value::<GradeOutput>(v).ok())
        });

        match parsed {
            Ok(Some(output)) if output.score.is_finite() => {
                grade.score = Some(output.score.clamp(0.0, 100.0));
                grade.feedback = output.feedback;
            }
            Ok(_) => {
                warn!(scene_id = %scene.id, "Grading reply had no usable score");
                grade.feedback = FALLBACK_FEEDBACK.to_string();
            }
            Err(e) => {
                warn!(scene_id = %scene.id, error = ?e, "Grading call failed");
                grade.feedback = FALLBACK_FEEDBACK.to_string();
            }
        }
        Ok(grade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLLMClient;
    use crate::run::NewLogEntry;
    use crate::scenario::fixtures;
    use crate::store::InMemoryStore;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn grade(score: Option<f64>) -> SceneGrade {
        SceneGrade {
            scene_id: Uuid::new_v4(),
            title: "Scene".to_string(),
            score,
            feedback: String::new(),
        }
    }

    #[test]
    fn test_overall_score_skips_ungraded_scenes() {
        let grades = vec![grade(Some(80.0)), grade(Some(90.0)), grade(None), grade(Some(70.0))];
        assert_relative_eq!(overall_score(&grades, None).unwrap(), 80.0);
        assert_eq!(overall_score(&[grade(None)], None), None);
    }

    #[test]
    fn test_overall_score_with_weights() {
        let grades = vec![grade(Some(100.0)), grade(Some(40.0))];
        let weights = HashMap::from([(grades[0].scene_id, 3.0)]);
        // (100 * 3 + 40 * 1) / 4
        assert_relative_eq!(overall_score(&grades, Some(&weights)).unwrap(), 85.0);
    }

    async fn seeded_run(store: &InMemoryStore, scene_count: u32) -> (crate::scenario::Scenario, SimulationRun) {
        let scenario = fixtures::scenario(scene_count, 5);
        store.insert_scenario(scenario.clone());
        let mut run = SimulationRun::new("s1", &scenario, Utc::now());
        run.scene_progress[0].achievement_score = Some(60.0);
        store.replace_run(&run).await.unwrap();
        (scenario, run)
    }

    fn grader(store: Arc<InMemoryStore>, llm: MockLLMClient) -> Grader {
        Grader::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(llm),
            Arc::new(PromptTemplates::default()),
        )
    }

    #[tokio::test]
    async fn test_grade_report_uses_model_scores_and_clamps() {
        let store = Arc::new(InMemoryStore::new());
        let (scenario, run) = seeded_run(&store, 2).await;
        for scene in &scenario.scenes {
            store
                .append(NewLogEntry::user(run.id, scene.id, "s1", &format!("plan for {}", scene.title)))
                .await
                .unwrap();
        }
        let mut llm = MockLLMClient::new();
        llm.expect_complete().returning(|system, _| {
            if system.contains("plan for Scene 1") {
                Ok(r#"Here you go: {"score": 140, "feedback": "Excellent."}"#.to_string())
            } else {
                Ok(r#"{"score": 50, "feedback": "Thin analysis."}"#.to_string())
            }
        });

        let report = grader(store, llm).grade("s1", run.id, None).await.unwrap();

        assert_eq!(report.per_scene[0].score, Some(100.0));
        assert_eq!(report.per_scene[0].feedback, "Excellent.");
        assert_eq!(report.per_scene[1].score, Some(50.0));
        assert_relative_eq!(report.overall_score.unwrap(), 75.0);
        assert!(report.overall_feedback.contains("Strongest scene: \"Scene 1\""));
    }

    #[tokio::test]
    async fn test_grade_falls_back_to_stored_score() {
        let store = Arc::new(InMemoryStore::new());
        let (scenario, run) = seeded_run(&store, 2).await;
        store
            .append(NewLogEntry::user(run.id, scenario.scenes[0].id, "s1", "my answer"))
            .await
            .unwrap();
        let mut llm = MockLLMClient::new();
        llm.expect_complete()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("gateway timeout")));

        let report = grader(store, llm).grade("s1", run.id, None).await.unwrap();

        assert_eq!(report.per_scene[0].score, Some(60.0));
        assert_eq!(report.per_scene[0].feedback, FALLBACK_FEEDBACK);
        // Never reached, no messages, no stored score.
        assert_eq!(report.per_scene[1].score, None);
        assert_eq!(report.per_scene[1].feedback, NO_MESSAGES_FEEDBACK);
        assert_relative_eq!(report.overall_score.unwrap(), 60.0);
    }

    #[tokio::test]
    async fn test_grade_is_restricted_to_owner() {
        let store = Arc::new(InMemoryStore::new());
        let (_, run) = seeded_run(&store, 1).await;
        let mut llm = MockLLMClient::new();
        llm.expect_complete().never();

        let result = grader(store, llm).grade("someone-else", run.id, None).await;
        assert!(matches!(result, Err(SimulationError::Unauthorized(_))));
    }
}
