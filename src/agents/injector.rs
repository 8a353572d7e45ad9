//! LLM-backed bug injector.
//!
//! Asks the model for a complete artifact in one JSON response: a code-only
//! bug diff, the oracle test content, and the command that runs the oracle
//! alone. Structural problems with the response are expected-negative
//! ([`AgentError::Malformed`]), not infrastructure failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::Injector;
use crate::error::AgentError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::model::{BugArtifact, Environment, InjectionStrategy};
use crate::utils::json_extraction::extract_json_object;

const INJECTOR_SYSTEM_PROMPT: &str = "\
You are an expert software engineer creating a bug artifact for training purposes.

Inject a realistic bug into the codebase and write one oracle regression test
that fails on the buggy code but passes on the clean code.

RULES:
- The bug must live in CODE files only, never in tests, CI config or lockfiles.
- The bug should be subtle but deterministically detectable by the oracle test.
- The oracle test must target the injected defect specifically, not generic
  behavior that any random code change would break.

Respond with a single JSON object:
{
  \"source_file\": \"path of the primary file the bug touches\",
  \"test_file\": \"path where the oracle test should be written\",
  \"bug_diff\": \"unified diff introducing the bug\",
  \"oracle_test\": \"full content of the oracle test file\",
  \"test_command\": \"command that runs the oracle test alone\"
}";

/// Strategy-specific instructions appended to the prompt.
fn strategy_instructions(strategy: InjectionStrategy) -> &'static str {
    match strategy {
        InjectionStrategy::Direct => {
            "STRATEGY direct: modify existing logic in place. Prefer subtle changes \
             like off-by-one errors, wrong operators, or missing checks."
        }
        InjectionStrategy::RemovalOnly => {
            "STRATEGY removal_only: inject the bug ONLY by removing code (lines, \
             branches or calls). Do not add new code. The repository must still run."
        }
        InjectionStrategy::HistoryAware => {
            "STRATEGY history_aware: reintroduce a plausible historical bug, as if \
             reverting an old fix. Keep the diff minimal."
        }
    }
}

/// JSON shape the model is asked to produce.
#[derive(Debug, Deserialize)]
struct ArtifactPayload {
    source_file: String,
    test_file: String,
    bug_diff: String,
    oracle_test: String,
    test_command: String,
}

/// Injector that drives an [`LlmProvider`].
pub struct LlmInjector {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmInjector {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    fn user_prompt(env: &Environment, strategy: InjectionStrategy, seed: u64) -> String {
        format!(
            "Environment: {name}\n\
             Language: {language}\n\
             Full test suite command: {test_command}\n\
             Generation seed: {seed}\n\n\
             {instructions}",
            name = env.name,
            language = env.language,
            test_command = env.test_command,
            instructions = strategy_instructions(strategy),
        )
    }
}

#[async_trait]
impl Injector for LlmInjector {
    async fn inject(
        &self,
        env: &Environment,
        strategy: InjectionStrategy,
        seed: u64,
    ) -> Result<BugArtifact, AgentError> {
        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(INJECTOR_SYSTEM_PROMPT),
                Message::user(Self::user_prompt(env, strategy, seed)),
            ],
        )
        .with_temperature(0.7);

        let response = self.llm.generate(request).await?;
        let content = response
            .first_content()
            .ok_or_else(|| AgentError::Malformed("empty injector response".to_string()))?;

        let json = extract_json_object(content)
            .ok_or_else(|| AgentError::Malformed("no JSON object in injector response".to_string()))?;
        let payload: ArtifactPayload = serde_json::from_str(&json)
            .map_err(|e| AgentError::Malformed(format!("artifact JSON does not parse: {e}")))?;

        let artifact = BugArtifact {
            source_file: payload.source_file,
            test_file: payload.test_file,
            bug_diff: payload.bug_diff,
            oracle_test: payload.oracle_test,
            test_command: payload.test_command,
            strategy,
            seed,
        };
        artifact.validate_fields().map_err(AgentError::Malformed)?;

        tracing::info!(
            env = %env.name,
            strategy = %strategy,
            source_file = %artifact.source_file,
            "injector produced artifact"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationResponse};
    use crate::model::LanguageHint;

    struct CannedLlm(String);

    #[async_trait]
    impl LlmProvider for CannedLlm {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            Ok(GenerationResponse {
                id: "r".to_string(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.0.clone()),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
            })
        }
    }

    fn env() -> Environment {
        Environment::new("calc", "python:3.12-slim", LanguageHint::Python, "pytest")
    }

    #[tokio::test]
    async fn parses_well_formed_artifact() {
        let payload = serde_json::json!({
            "source_file": "src/calc.py",
            "test_file": "tests/test_oracle.py",
            "bug_diff": "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1,1 +1,1 @@\n-x\n+y\n",
            "oracle_test": "def test_oracle(): ...",
            "test_command": "pytest tests/test_oracle.py",
        });
        let llm = Arc::new(CannedLlm(format!("Here it is:\n```json\n{payload}\n```")));
        let injector = LlmInjector::new(llm, "test-model");
        let artifact = injector
            .inject(&env(), InjectionStrategy::Direct, 11)
            .await
            .unwrap();
        assert_eq!(artifact.source_file, "src/calc.py");
        assert_eq!(artifact.seed, 11);
        assert_eq!(artifact.strategy, InjectionStrategy::Direct);
    }

    #[tokio::test]
    async fn missing_fields_are_malformed() {
        let llm = Arc::new(CannedLlm(
            "{\"source_file\": \"a.py\", \"test_file\": \"t.py\"}".to_string(),
        ));
        let injector = LlmInjector::new(llm, "test-model");
        let err = injector
            .inject(&env(), InjectionStrategy::RemovalOnly, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Malformed(_)));
    }

    #[tokio::test]
    async fn prose_without_json_is_malformed() {
        let llm = Arc::new(CannedLlm("I refuse to answer in JSON".to_string()));
        let injector = LlmInjector::new(llm, "test-model");
        let err = injector
            .inject(&env(), InjectionStrategy::Direct, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Malformed(_)));
    }
}
