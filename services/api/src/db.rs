//! Data Access Layer
//!
//! PostgreSQL implementations of the simulation store traits. Queries use the
//! runtime-checked `sqlx` API so the crate builds without a live database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use casesim_core::{
    run::{ConversationLogEntry, NewLogEntry, SceneProgressRecord, SimulationRun},
    scenario::{Persona, Scenario},
    store::{ConversationLog, RunStore, ScenarioCatalog},
};
use sqlx::{PgPool, Postgres, Transaction, types::Json};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    LogRow, PersonaRow, RunRow, ScenarioRow, ScenePersonaRow, SceneProgressRow, SceneRow,
};

const RUN_COLUMNS: &str = "id, student_id, scenario_id, current_scene_id, status, completed_scene_ids, \
     forced_progressions, orchestrator_state, final_score, version, created_at, updated_at, completed_at";

const LOG_COLUMNS: &str =
    "id, run_id, scene_id, message_type, sender_name, persona_id, content, order_index, created_at";

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn scene_progress(&self, run_id: Uuid) -> Result<Vec<SceneProgressRecord>> {
        let rows = sqlx::query_as::<_, SceneProgressRow>(
            r#"
            SELECT scene_id, status, attempts, goal_achieved, forced_progression,
                   user_messages, ai_responses, achievement_score, started_at, completed_at
            FROM scene_progress
            WHERE run_id = $1
            ORDER BY started_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SceneProgressRecord::try_from).collect()
    }

    async fn insert_log_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: NewLogEntry,
    ) -> Result<ConversationLogEntry> {
        let row = sqlx::query_as::<_, LogRow>(&format!(
            r#"
            INSERT INTO conversation_logs
                (id, run_id, scene_id, message_type, sender_name, persona_id, content, order_index)
            SELECT $1, $2, $3, $4, $5, $6, $7, COALESCE(MAX(order_index) + 1, 0)
            FROM conversation_logs
            WHERE run_id = $2
            RETURNING {}
            "#,
            LOG_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.run_id)
        .bind(entry.scene_id)
        .bind(entry.message_type.as_str())
        .bind(&entry.sender_name)
        .bind(&entry.persona_id)
        .bind(&entry.content)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to append conversation log entry")?;
        row.try_into()
    }

    async fn upsert_scene_progress(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        records: &[SceneProgressRecord],
    ) -> Result<()> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO scene_progress
                    (run_id, scene_id, status, attempts, goal_achieved, forced_progression,
                     user_messages, ai_responses, achievement_score, started_at, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (run_id, scene_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    attempts = EXCLUDED.attempts,
                    goal_achieved = EXCLUDED.goal_achieved,
                    forced_progression = EXCLUDED.forced_progression,
                    user_messages = EXCLUDED.user_messages,
                    ai_responses = EXCLUDED.ai_responses,
                    achievement_score = EXCLUDED.achievement_score,
                    completed_at = EXCLUDED.completed_at
                "#,
            )
            .bind(run_id)
            .bind(record.scene_id)
            .bind(record.status.as_str())
            .bind(record.attempts as i32)
            .bind(record.goal_achieved)
            .bind(record.forced_progression)
            .bind(record.user_messages as i32)
            .bind(record.ai_responses as i32)
            .bind(record.achievement_score)
            .bind(record.started_at)
            .bind(record.completed_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ScenarioCatalog for Db {
    async fn get_scenario(&self, scenario_id: Uuid) -> Result<Option<Scenario>> {
        let Some(header) = sqlx::query_as::<_, ScenarioRow>(
            "SELECT id, title, description, challenge, student_role FROM scenarios WHERE id = $1",
        )
        .bind(scenario_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let personas = sqlx::query_as::<_, PersonaRow>(
            r#"
            SELECT id, name, role, background, personality_traits, goals, archetype
            FROM personas
            WHERE scenario_id = $1
            ORDER BY name ASC
            "#,
        )
        .bind(scenario_id)
        .fetch_all(&self.pool)
        .await?;

        let scene_rows = sqlx::query_as::<_, SceneRow>(
            r#"
            SELECT id, scene_order, title, description, user_goal, success_metric, timeout_turns
            FROM scenes
            WHERE scenario_id = $1
            ORDER BY scene_order ASC
            "#,
        )
        .bind(scenario_id)
        .fetch_all(&self.pool)
        .await?;

        let links = sqlx::query_as::<_, ScenePersonaRow>(
            "SELECT scene_id, persona_id FROM scene_personas WHERE scenario_id = $1 ORDER BY persona_id",
        )
        .bind(scenario_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_scene: HashMap<Uuid, Vec<String>> = HashMap::new();
        for link in links {
            by_scene.entry(link.scene_id).or_default().push(link.persona_id);
        }

        let mut scenario = Scenario {
            id: header.id,
            title: header.title,
            description: header.description,
            challenge: header.challenge,
            student_role: header.student_role,
            scenes: scene_rows
                .into_iter()
                .map(|row| {
                    let persona_ids = by_scene.remove(&row.id).unwrap_or_default();
                    row.into_scene(persona_ids)
                })
                .collect(),
            personas: personas.into_iter().map(Persona::from).collect(),
        };
        scenario.sort_scenes();
        Ok(Some(scenario))
    }
}

#[async_trait]
impl RunStore for Db {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<SimulationRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM simulation_runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let progress = self.scene_progress(run_id).await?;
                Ok(Some(row.into_run(progress)?))
            }
            None => Ok(None),
        }
    }

    async fn replace_run(&self, run: &SimulationRun) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Progress and log rows go with their run via ON DELETE CASCADE.
        let removed = sqlx::query("DELETE FROM simulation_runs WHERE student_id = $1 AND scenario_id = $2")
            .bind(&run.student_id)
            .bind(run.scenario_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed > 0 {
            debug!(student_id = %run.student_id, removed, "Discarded previous runs");
        }

        sqlx::query(
            r#"
            INSERT INTO simulation_runs
                (id, student_id, scenario_id, current_scene_id, status, completed_scene_ids,
                 forced_progressions, orchestrator_state, final_score, version,
                 created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(&run.student_id)
        .bind(run.scenario_id)
        .bind(run.current_scene_id)
        .bind(run.status.as_str())
        .bind(Json(&run.completed_scene_ids))
        .bind(run.forced_progressions as i32)
        .bind(Json(&run.orchestrator))
        .bind(run.final_score)
        .bind(run.version)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.completed_at)
        .execute(&mut *tx)
        .await?;

        Self::upsert_scene_progress(&mut tx, run.id, &run.scene_progress).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_run(&self, run: &SimulationRun) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE simulation_runs SET
                current_scene_id = $3,
                status = $4,
                completed_scene_ids = $5,
                forced_progressions = $6,
                orchestrator_state = $7,
                final_score = $8,
                completed_at = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(run.id)
        .bind(run.version)
        .bind(run.current_scene_id)
        .bind(run.status.as_str())
        .bind(Json(&run.completed_scene_ids))
        .bind(run.forced_progressions as i32)
        .bind(Json(&run.orchestrator))
        .bind(run.final_score)
        .bind(run.completed_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::upsert_scene_progress(&mut tx, run.id, &run.scene_progress).await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl ConversationLog for Db {
    async fn append(&self, entry: NewLogEntry) -> Result<ConversationLogEntry> {
        let mut tx = self.pool.begin().await?;
        let stored = Self::insert_log_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn append_all(&self, entries: Vec<NewLogEntry>) -> Result<Vec<ConversationLogEntry>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(entries.len());
        for entry in entries {
            stored.push(Self::insert_log_entry(&mut tx, entry).await?);
        }
        tx.commit().await?;
        debug!(count = stored.len(), "Appended turn log entries");
        Ok(stored)
    }

    async fn scene_entries(&self, run_id: Uuid, scene_id: Uuid) -> Result<Vec<ConversationLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(&format!(
            "SELECT {} FROM conversation_logs WHERE run_id = $1 AND scene_id = $2 ORDER BY order_index ASC",
            LOG_COLUMNS
        ))
        .bind(run_id)
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ConversationLogEntry::try_from).collect()
    }
}
