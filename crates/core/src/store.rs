//! Storage Contracts
//!
//! The simulation runtime reads scenarios and reads/writes runs and the
//! conversation log through these traits. `InMemoryStore` backs tests and
//! local development; the API service implements them over PostgreSQL.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::run::{ConversationLogEntry, NewLogEntry, SimulationRun};
use crate::scenario::Scenario;

/// Read-only access to authored scenarios.
#[async_trait]
pub trait ScenarioCatalog: Send + Sync {
    /// Loads a scenario with its scenes in authored order and its persona roster.
    async fn get_scenario(&self, scenario_id: Uuid) -> Result<Option<Scenario>>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<SimulationRun>>;

    /// Inserts a new run, deleting any earlier run (and its log) for the same student and scenario.
    async fn replace_run(&self, run: &SimulationRun) -> Result<()>;

    /// Persists `run` if the stored version still equals `run.version`, storing it as
    /// `run.version + 1`. Returns `false` when another writer got there first.
    async fn save_run(&self, run: &SimulationRun) -> Result<bool>;
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Appends an entry, assigning the next order index for its run.
    async fn append(&self, entry: NewLogEntry) -> Result<ConversationLogEntry>;

    /// Appends entries in order. Stores that can should write them atomically.
    async fn append_all(&self, entries: Vec<NewLogEntry>) -> Result<Vec<ConversationLogEntry>> {
        let mut stored = Vec::with_capacity(entries.len());
        for entry in entries {
            stored.push(self.append(entry).await?);
        }
        Ok(stored)
    }

    /// Entries of one scene of one run, in order.
    async fn scene_entries(&self, run_id: Uuid, scene_id: Uuid) -> Result<Vec<ConversationLogEntry>>;
}

#[derive(Default)]
struct MemoryTables {
    scenarios: HashMap<Uuid, Scenario>,
    runs: HashMap<Uuid, SimulationRun>,
    logs: Vec<ConversationLogEntry>,
}

/// A process-local store for tests and development.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<MemoryTables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scenario(&self, scenario: Scenario) {
        self.lock().scenarios.insert(scenario.id, scenario);
    }

    /// Every entry of a run, across scenes.
    pub fn run_entries(&self, run_id: Uuid) -> Vec<ConversationLogEntry> {
        self.lock()
            .logs
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        // A poisoned lock only means a test thread panicked mid-write.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ScenarioCatalog for InMemoryStore {
    async fn get_scenario(&self, scenario_id: Uuid) -> Result<Option<Scenario>> {
        Ok(self.lock().scenarios.get(&scenario_id).cloned().map(|mut s| {
            s.sort_scenes();
            s
        }))
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<SimulationRun>> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn replace_run(&self, run: &SimulationRun) -> Result<()> {
        let mut tables = self.lock();
        let stale: Vec<Uuid> = tables
            .runs
            .values()
            .filter(|r| r.student_id == run.student_id && r.scenario_id == run.scenario_id)
            .map(|r| r.id)
            .collect();
        for id in &stale {
            tables.runs.remove(id);
        }
        tables.logs.retain(|e| !stale.contains(&e.run_id));
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &SimulationRun) -> Result<bool> {
        let mut tables = self.lock();
        match tables.runs.get_mut(&run.id) {
            Some(stored) if stored.version == run.version => {
                let mut next = run.clone();
                next.version += 1;
                next.updated_at = Utc::now();
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ConversationLog for InMemoryStore {
    async fn append(&self, entry: NewLogEntry) -> Result<ConversationLogEntry> {
        let mut tables = self.lock();
        let order_index = tables
            .logs
            .iter()
            .filter(|e| e.run_id == entry.run_id)
            .map(|e| e.order_index)
            .max()
            .map_or(0, |max| max + 1);
        let stored = entry.staged(order_index, Utc::now());
        tables.logs.push(stored.clone());
        Ok(stored)
    }

    async fn scene_entries(&self, run_id: Uuid, scene_id: Uuid) -> Result<Vec<ConversationLogEntry>> {
        let mut entries: Vec<_> = self
            .lock()
            .logs
            .iter()
            .filter(|e| e.run_id == run_id && e.scene_id == scene_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.order_index);
        Ok(entries)
    }
}
