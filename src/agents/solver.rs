//! LLM-backed blind solver.
//!
//! The solver sees only the oracle test, its invocation command and the
//! failing output from the buggy snapshot. It never sees the bug diff or any
//! hint of what was changed.

use std::sync::Arc;

use async_trait::async_trait;

use super::{SolveRequest, Solver};
use crate::error::AgentError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::utils::json_extraction::extract_unified_diff;

const SOLVER_SYSTEM_PROMPT: &str = "\
You are an expert software engineer fixing a bug in a codebase.

A regression test is failing. Your only information is the test itself, the
command that runs it, and its failing output. Diagnose the defect the test
exercises and produce a minimal fix.

RULES:
- Fix the CODE. Never modify the test, and never weaken assertions.
- Keep the change minimal; do not refactor unrelated code.

Respond with a single unified diff (applies with `patch -p1` at the repository
root) inside a ```diff code fence. No other edits, no commentary outside the
fence.";

/// Solver that drives an [`LlmProvider`].
pub struct LlmSolver {
    llm: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmSolver {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn user_prompt(request: &SolveRequest) -> String {
        format!(
            "Attempt {attempt}.\n\n\
             Oracle test ({command}):\n```\n{test}\n```\n\n\
             Failing output:\n```\n{output}\n```\n\n\
             Produce the fix as a unified diff.",
            attempt = request.attempt,
            command = request.test_command,
            test = request.oracle_test,
            output = request.failing_output,
        )
    }
}

#[async_trait]
impl Solver for LlmSolver {
    async fn propose_patch(&self, request: &SolveRequest) -> Result<String, AgentError> {
        let generation = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(SOLVER_SYSTEM_PROMPT),
                Message::user(Self::user_prompt(request)),
            ],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self.llm.generate(generation).await?;
        let content = response
            .first_content()
            .ok_or_else(|| AgentError::Malformed("empty solver response".to_string()))?;

        extract_unified_diff(content)
            .ok_or_else(|| AgentError::Malformed("no unified diff in solver response".to_string()))
    }
}
