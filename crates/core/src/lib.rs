//! Core of the case-study simulator: scenarios, run state, scene progression,
//! goal validation, chat orchestration and grading.

pub mod error;
pub mod goal;
pub mod grading;
pub mod llm_client;
pub mod mention;
pub mod orchestrator;
pub mod progression;
pub mod prompt;
pub mod run;
pub mod scenario;
pub mod store;

pub use error::{SimulationError, SimulationResult};
pub use grading::{GradeReport, Grader, SceneGrade};
pub use orchestrator::{ChatOrchestrator, ChatReply, StartedRun};
