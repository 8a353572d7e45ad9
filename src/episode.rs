//! Episode aggregate and its lifecycle state machine.
//!
//! An episode is one full inject → validate → solve → evaluate cycle against
//! one environment. Status moves through an explicit enumerated state machine
//! with a single transition function; illegal (state, event) pairs are
//! rejected loudly instead of silently patching a status string.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EpisodeError;
use crate::model::{BugArtifact, InjectionStrategy, SolverAttempt, ValidationReport};

/// Episode execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Injecting,
    Validating,
    Solving,
    Completed,
    Failed,
    Cancelled,
}

impl EpisodeStatus {
    /// Terminal statuses permit no further mutation of the episode.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Injecting => "injecting",
            Self::Validating => "validating",
            Self::Solving => "solving",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a status from its persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "injecting" => Some(Self::Injecting),
            "validating" => Some(Self::Validating),
            "solving" => Some(Self::Solving),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive episode status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeEvent {
    /// Start requested; environment confirmed to exist.
    StartRequested,
    /// Injector returned a non-null artifact.
    ArtifactReceived,
    /// Validation finished with `report.passed == true`.
    ValidationPassed,
    /// Validation finished with `report.passed == false`.
    ValidationRejected,
    /// Solve loop ended (solved or attempts exhausted).
    SolveLoopEnded,
    /// Infrastructure failure in any phase.
    InfrastructureFailed,
    /// External cancellation request.
    CancelRequested,
}

impl EpisodeEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StartRequested => "start_requested",
            Self::ArtifactReceived => "artifact_received",
            Self::ValidationPassed => "validation_passed",
            Self::ValidationRejected => "validation_rejected",
            Self::SolveLoopEnded => "solve_loop_ended",
            Self::InfrastructureFailed => "infrastructure_failed",
            Self::CancelRequested => "cancel_requested",
        }
    }
}

/// The single legal-transition table for episode statuses.
///
/// Returns the next status, or an error describing why the pair is illegal.
pub fn transition(
    status: EpisodeStatus,
    event: EpisodeEvent,
) -> Result<EpisodeStatus, EpisodeError> {
    use EpisodeEvent as E;
    use EpisodeStatus as S;

    let next = match (status, event) {
        (S::Pending, E::StartRequested) => Some(S::Injecting),
        (S::Injecting, E::ArtifactReceived) => Some(S::Validating),
        (S::Validating, E::ValidationPassed) => Some(S::Solving),
        (S::Validating, E::ValidationRejected) => Some(S::Failed),
        (S::Solving, E::SolveLoopEnded) => Some(S::Completed),
        // Infrastructure failure terminates from any non-terminal state.
        (s, E::InfrastructureFailed) if !s.is_terminal() => Some(S::Failed),
        // Cancellation is reachable from any non-terminal state.
        (s, E::CancelRequested) if !s.is_terminal() => Some(S::Cancelled),
        _ => None,
    };

    next.ok_or_else(|| EpisodeError::InvalidTransition {
        from: status.to_string(),
        to: format!("event {}", event.name()),
        reason: if status.is_terminal() {
            "episode is terminal".to_string()
        } else {
            "event not legal in this state".to_string()
        },
    })
}

/// The episode aggregate root.
///
/// Exclusively owns its artifact, validation report and attempt history;
/// references (never owns) its environment. Mutated only by the orchestrator
/// as phases advance, and never after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: Uuid,
    pub env_id: Uuid,
    pub status: EpisodeStatus,
    /// Human-readable phase label shown in listings.
    pub phase: String,
    pub max_attempts: u32,
    /// Injection strategy requested for this episode.
    #[serde(default)]
    pub strategy: InjectionStrategy,
    /// Seed for the injector and the inverse-mutation checks.
    #[serde(default)]
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<BugArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_report: Option<ValidationReport>,
    #[serde(default)]
    pub attempts: Vec<SolverAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Model identifier used for both agents, if driven by an LLM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Episode {
    /// Create a fresh pending episode against an environment.
    pub fn new(env_id: Uuid, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            episode_id: Uuid::new_v4(),
            env_id,
            status: EpisodeStatus::Pending,
            phase: "pending".to_string(),
            max_attempts: max_attempts.max(1),
            strategy: InjectionStrategy::default(),
            seed: 0,
            artifact: None,
            validation_report: None,
            attempts: Vec::new(),
            final_reward: None,
            error: None,
            model_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the injection request this episode will run with.
    pub fn with_injection(mut self, strategy: InjectionStrategy, seed: u64) -> Self {
        self.strategy = strategy;
        self.seed = seed;
        self
    }

    /// Advance the status through the transition table.
    ///
    /// Rejects any mutation of a terminal episode (append-only history).
    pub fn advance(&mut self, event: EpisodeEvent) -> Result<(), EpisodeError> {
        if self.status.is_terminal() {
            return Err(EpisodeError::Terminal {
                id: self.episode_id.to_string(),
                status: self.status.to_string(),
            });
        }
        self.status = transition(self.status, event)?;
        self.phase = self.status.as_str().to_string();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a solver attempt, enforcing contiguous 1-based indices.
    pub fn push_attempt(&mut self, attempt: SolverAttempt) -> Result<(), EpisodeError> {
        if self.status.is_terminal() {
            return Err(EpisodeError::Terminal {
                id: self.episode_id.to_string(),
                status: self.status.to_string(),
            });
        }
        let expected = self.attempts.len() as u32 + 1;
        if attempt.index != expected {
            return Err(EpisodeError::Storage(format!(
                "attempt index {} out of order, expected {}",
                attempt.index, expected
            )));
        }
        self.attempts.push(attempt);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether any recorded attempt solved the bug.
    pub fn solved(&self) -> bool {
        self.attempts.iter().any(|a| a.solved)
    }

    /// Episode-level reward: 1.0 if any attempt solved, else 0.0.
    pub fn compute_reward(&self) -> f64 {
        if self.solved() {
            1.0
        } else {
            0.0
        }
    }
}
