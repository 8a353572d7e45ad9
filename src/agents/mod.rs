//! Injector and solver capability traits.
//!
//! The orchestrator depends only on these contracts. Production
//! implementations call an LLM; tests provide deterministic stubs, which is
//! what makes the episode pipeline testable end to end.

pub mod injector;
pub mod solver;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::model::{BugArtifact, Environment, InjectionStrategy};

pub use injector::LlmInjector;
pub use solver::LlmSolver;

/// Produces a bug diff plus oracle test for an environment.
#[async_trait]
pub trait Injector: Send + Sync {
    /// Generate a bug artifact. Called exactly once per episode.
    async fn inject(
        &self,
        env: &Environment,
        strategy: InjectionStrategy,
        seed: u64,
    ) -> Result<BugArtifact, AgentError>;
}

/// Inputs handed to the solver for one attempt.
///
/// Deliberately excludes the bug diff and the bug's identity: the solver
/// works from test feedback alone.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    /// Full content of the oracle regression test.
    pub oracle_test: String,
    /// Command that runs the oracle test.
    pub test_command: String,
    /// Output of the failing oracle run on the buggy snapshot.
    pub failing_output: String,
    /// 1-based attempt index, for prompt variation across retries.
    pub attempt: u32,
}

/// Proposes a fix patch for a buggy snapshot.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Return a unified diff expected to apply at the snapshot root.
    async fn propose_patch(&self, request: &SolveRequest) -> Result<String, AgentError>;
}
