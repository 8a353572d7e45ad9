//! Error types for bugforge operations.
//!
//! Defines error types for the major subsystems:
//! - Sandbox execution and snapshot management
//! - LLM API interactions
//! - Injector/solver agent failures
//! - Episode lifecycle and state transitions
//! - Unified-diff parsing

use thiserror::Error;

/// Errors that can occur while driving a sandbox.
///
/// These are infrastructure failures only. A command that merely exits
/// non-zero, or a test that fails, is an ordinary [`crate::sandbox::ExecOutput`]
/// and never surfaces through this type.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to start sandbox container '{name}': {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Snapshot '{0}' not found in sandbox")]
    SnapshotNotFound(String),

    #[error("Snapshot '{0}' already exists in sandbox")]
    SnapshotExists(String),

    #[error("Failed to write file '{path}' in sandbox: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Sandbox exec transport failed: {0}")]
    ExecTransport(String),

    #[error("Invalid path '{0}': shell metacharacters or traversal not allowed")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: BUGFORGE_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors that can occur inside the injector or solver agents.
///
/// `Malformed` is an expected-negative outcome: the orchestrator turns it
/// into a failed episode phase (injector) or a consumed attempt (solver)
/// rather than an infrastructure failure.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent produced malformed output: {0}")]
    Malformed(String),

    #[error("Agent declined to produce output: {0}")]
    Declined(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Errors that can occur during episode lifecycle management.
#[derive(Debug, Error)]
pub enum EpisodeError {
    #[error("Invalid state transition from '{from}' to '{to}': {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Episode '{0}' not found")]
    NotFound(String),

    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Episode '{id}' is terminal ({status}) and cannot be mutated")]
    Terminal { id: String, status: String },

    #[error("Infrastructure failure during phase '{phase}': {reason}")]
    Infrastructure { phase: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors that can occur while parsing or applying unified diffs.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Diff contains no file headers")]
    Empty,

    #[error("Malformed hunk header at line {line}: {text}")]
    MalformedHunk { line: usize, text: String },

    #[error("Hunk does not apply at line {line}: expected '{expected}', found '{found}'")]
    ApplyConflict {
        line: usize,
        expected: String,
        found: String,
    },
}
