//! Case Simulation API Library Crate
//!
//! Application state, PostgreSQL storage, HTTP handlers and routing for the
//! simulation service. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
