//! bugforge: self-play bug injection and repair episodes for SWE training.
//!
//! An injector model plants a bug plus an oracle test into a sandboxed
//! codebase, a seven-step validator checks the bug is real, observable and
//! fairly scoped, then a solver model gets a bounded number of blind repair
//! attempts. Each episode ends with a binary reward and is persisted in
//! SQLite.

// Core modules
pub mod agents;
pub mod cli;
pub mod config;
pub mod diff;
pub mod episode;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod model;
pub mod mutation;
pub mod orchestrator;
pub mod sandbox;
pub mod solve;
pub mod storage;
pub mod validator;

mod utils;

// Re-export commonly used error types
pub use error::{AgentError, DiffError, EpisodeError, LlmError, SandboxError};
