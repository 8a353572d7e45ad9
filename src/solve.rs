//! Bounded blind-fix solve loop.
//!
//! Runs up to `max_attempts` solver iterations against a validated buggy
//! snapshot. Each attempt works on a fresh fork of `buggy`, so a bad patch
//! from attempt N can never contaminate attempt N+1. An attempt counts as
//! solved only when the oracle test passes *and* the full suite exits zero on
//! the patched snapshot.
//!
//! A solver that returns garbage (no diff, a diff that does not apply)
//! consumes its attempt; only LLM transport failures and sandbox failures
//! abort the loop as infrastructure errors.

use chrono::Utc;
use std::time::Duration;

use crate::agents::{SolveRequest, Solver};
use crate::error::{AgentError, EpisodeError, SandboxError};
use crate::model::{BugArtifact, Environment, SolverAttempt};
use crate::orchestrator::CancelToken;
use crate::sandbox::{snapshots, with_retries, Sandbox};
use crate::utils::tail;

/// Path inside an attempt snapshot where the fix diff is staged.
const FIX_DIFF_PATH: &str = ".bugforge/fix.diff";

/// Gates an attempt must clear: the oracle test and the full suite.
const GATES: u32 = 2;

/// Captured output is bounded so attempt records stay storable.
const OUTPUT_LIMIT: usize = 4000;

/// Outcome of a full solve loop.
#[derive(Debug)]
pub struct SolveReport {
    pub attempts: Vec<SolverAttempt>,
    /// True when the loop stopped on a cancellation request rather than a
    /// solve or attempt exhaustion.
    pub cancelled: bool,
}

impl SolveReport {
    pub fn solved(&self) -> bool {
        self.attempts.iter().any(|a| a.solved)
    }
}

/// Drives solver attempts against one validated artifact.
pub struct SolveLoop {
    max_attempts: u32,
    test_timeout: Duration,
    infra_retries: u32,
}

impl SolveLoop {
    pub fn new(max_attempts: u32, test_timeout: Duration, infra_retries: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            test_timeout,
            infra_retries,
        }
    }

    /// Run the loop from attempt 1. Short-circuits on the first solved
    /// attempt; checks the cancel token between attempts so an in-flight
    /// attempt always finishes and gets recorded.
    pub async fn run(
        &self,
        sandbox: &dyn Sandbox,
        solver: &dyn Solver,
        env: &Environment,
        artifact: &BugArtifact,
        cancel: &CancelToken,
    ) -> Result<SolveReport, EpisodeError> {
        self.run_from(sandbox, solver, env, artifact, cancel, 1).await
    }

    /// Run the loop starting at `first_attempt`, for resuming an episode that
    /// already has attempts recorded.
    pub async fn run_from(
        &self,
        sandbox: &dyn Sandbox,
        solver: &dyn Solver,
        env: &Environment,
        artifact: &BugArtifact,
        cancel: &CancelToken,
        first_attempt: u32,
    ) -> Result<SolveReport, EpisodeError> {
        let mut attempts = Vec::new();

        for index in first_attempt.max(1)..=self.max_attempts {
            if cancel.is_cancelled() {
                tracing::info!(attempt = index, "solve loop stopping on cancellation");
                return Ok(SolveReport {
                    attempts,
                    cancelled: true,
                });
            }

            let attempt = self.run_attempt(sandbox, solver, env, artifact, index).await?;
            let solved = attempt.solved;
            tracing::info!(
                attempt = index,
                solved,
                gates = format!("{}/{}", attempt.tests_passed, attempt.tests_total),
                "solver attempt finished"
            );
            attempts.push(attempt);
            if solved {
                break;
            }
        }

        Ok(SolveReport {
            attempts,
            cancelled: false,
        })
    }

    async fn run_attempt(
        &self,
        sandbox: &dyn Sandbox,
        solver: &dyn Solver,
        env: &Environment,
        artifact: &BugArtifact,
        index: u32,
    ) -> Result<SolverAttempt, EpisodeError> {
        let started = Utc::now();
        let snapshot = snapshots::attempt(index);

        with_retries(self.infra_retries, || {
            sandbox.fork(snapshots::BUGGY, &snapshot)
        })
        .await
        .map_err(infra)?;

        // Fresh failing output from this fork is the solver's only signal.
        let failing = with_retries(self.infra_retries, || {
            sandbox.exec(&snapshot, &artifact.test_command, self.test_timeout)
        })
        .await
        .map_err(infra)?;

        let request = SolveRequest {
            oracle_test: artifact.oracle_test.clone(),
            test_command: artifact.test_command.clone(),
            failing_output: tail(&failing.combined_output(), OUTPUT_LIMIT),
            attempt: index,
        };

        let patch = match self.propose(solver, &request).await {
            Ok(patch) => patch,
            Err(AgentError::Llm(e)) => {
                return Err(EpisodeError::Infrastructure {
                    phase: "solving".to_string(),
                    reason: e.to_string(),
                })
            }
            // Malformed or declined output consumes the attempt.
            Err(e) => {
                return Ok(SolverAttempt::record(
                    index,
                    None,
                    String::new(),
                    e.to_string(),
                    0,
                    GATES,
                    false,
                    started,
                ));
            }
        };

        with_retries(self.infra_retries, || {
            sandbox.write_file(&snapshot, FIX_DIFF_PATH, &patch)
        })
        .await
        .map_err(infra)?;
        let apply_cmd = format!("patch -p1 < {FIX_DIFF_PATH}");
        let apply = with_retries(self.infra_retries, || {
            sandbox.exec(&snapshot, &apply_cmd, self.test_timeout)
        })
        .await
        .map_err(infra)?;
        if !apply.success() {
            return Ok(SolverAttempt::record(
                index,
                Some(patch),
                tail(&apply.stdout, OUTPUT_LIMIT),
                tail(&apply.stderr, OUTPUT_LIMIT),
                0,
                GATES,
                false,
                started,
            ));
        }

        let oracle = with_retries(self.infra_retries, || {
            sandbox.exec(&snapshot, &artifact.test_command, self.test_timeout)
        })
        .await
        .map_err(infra)?;
        let suite = with_retries(self.infra_retries, || {
            sandbox.exec(&snapshot, &env.test_command, self.test_timeout)
        })
        .await
        .map_err(infra)?;

        let oracle_ok = oracle.success();
        let suite_ok = suite.success();
        let reported = if oracle_ok { &suite } else { &oracle };
        Ok(SolverAttempt::record(
            index,
            Some(patch),
            tail(&reported.stdout, OUTPUT_LIMIT),
            tail(&reported.stderr, OUTPUT_LIMIT),
            u32::from(oracle_ok) + u32::from(suite_ok),
            GATES,
            oracle_ok && suite_ok,
            started,
        ))
    }

    /// Call the solver, retrying only LLM transport failures.
    async fn propose(
        &self,
        solver: &dyn Solver,
        request: &SolveRequest,
    ) -> Result<String, AgentError> {
        let mut last = None;
        for retry in 0..=self.infra_retries {
            match solver.propose_patch(request).await {
                Err(AgentError::Llm(e)) => {
                    tracing::warn!(retry, error = %e, "solver LLM call failed, retrying");
                    last = Some(AgentError::Llm(e));
                }
                other => return other,
            }
        }
        Err(last.expect("at least one attempt ran"))
    }
}

fn infra(e: SandboxError) -> EpisodeError {
    EpisodeError::Infrastructure {
        phase: "solving".to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::error::LlmError;
    use crate::model::{InjectionStrategy, LanguageHint};
    use crate::sandbox::{ExecOutput, ScriptedSandbox};

    const CLEAN_CALC: &str = "def add(a, b):\n    return a + b\n";
    const BUGGY_CALC: &str = "def add(a, b):\n    return a - b\n";
    const FIX_DIFF: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

    /// Scripted solver returning canned patches per attempt index.
    struct SequenceSolver {
        patches: Vec<Result<String, AgentError>>,
        calls: AtomicU32,
    }

    impl SequenceSolver {
        fn new(patches: Vec<Result<String, AgentError>>) -> Self {
            Self {
                patches,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Solver for SequenceSolver {
        async fn propose_patch(&self, _request: &SolveRequest) -> Result<String, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.patches.get(n) {
                Some(Ok(p)) => Ok(p.clone()),
                Some(Err(AgentError::Malformed(m))) => Err(AgentError::Malformed(m.clone())),
                Some(Err(AgentError::Declined(m))) => Err(AgentError::Declined(m.clone())),
                Some(Err(AgentError::Llm(_))) => {
                    Err(AgentError::Llm(LlmError::RequestFailed("down".to_string())))
                }
                None => Err(AgentError::Declined("out of patches".to_string())),
            }
        }
    }

    fn env() -> Environment {
        Environment::new("calc", "img", LanguageHint::Python, "pytest")
    }

    fn artifact() -> BugArtifact {
        BugArtifact {
            source_file: "calc.py".to_string(),
            test_file: "tests/test_oracle.py".to_string(),
            bug_diff: String::new(),
            oracle_test: "def test_add(): ...".to_string(),
            test_command: "pytest tests/test_oracle.py".to_string(),
            strategy: InjectionStrategy::Direct,
            seed: 1,
        }
    }

    /// Sandbox with a materialized buggy snapshot; the oracle and suite both
    /// key off whether calc.py has been fixed.
    fn scripted() -> ScriptedSandbox {
        let sb = ScriptedSandbox::with_clean_files(&[("calc.py", CLEAN_CALC)]);
        sb.on_command("pytest", |ctx| {
            let fixed = ctx
                .files
                .get("calc.py")
                .is_some_and(|c| c.contains("return a + b"));
            if fixed {
                Ok(ExecOutput::completed(0, "all passed", ""))
            } else {
                Ok(ExecOutput::completed(1, "1 failed", "AssertionError"))
            }
        });
        sb
    }

    async fn seed_buggy(sb: &ScriptedSandbox) {
        sb.fork(snapshots::CLEAN, snapshots::BUGGY).await.unwrap();
        sb.write_file(snapshots::BUGGY, "calc.py", BUGGY_CALC)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn correct_patch_solves_on_first_attempt() {
        let sb = scripted();
        seed_buggy(&sb).await;
        let solver = SequenceSolver::new(vec![Ok(FIX_DIFF.to_string())]);
        let looper = SolveLoop::new(4, Duration::from_secs(5), 0);
        let report = looper
            .run(&sb, &solver, &env(), &artifact(), &CancelToken::new())
            .await
            .unwrap();

        assert!(report.solved());
        assert_eq!(report.attempts.len(), 1);
        let a = &report.attempts[0];
        assert_eq!((a.tests_passed, a.tests_total), (2, 2));
        assert_eq!(a.reward, 1.0);
        // Worked on its own fork, never on buggy itself.
        assert_eq!(
            sb.file_content(snapshots::BUGGY, "calc.py").unwrap(),
            BUGGY_CALC
        );
        assert!(sb
            .file_content(&snapshots::attempt(1), "calc.py")
            .unwrap()
            .contains("return a + b"));
    }

    #[tokio::test]
    async fn malformed_then_fix_consumes_first_attempt() {
        let sb = scripted();
        seed_buggy(&sb).await;
        let solver = SequenceSolver::new(vec![
            Err(AgentError::Malformed("no diff found".to_string())),
            Ok(FIX_DIFF.to_string()),
        ]);
        let looper = SolveLoop::new(4, Duration::from_secs(5), 0);
        let report = looper
            .run(&sb, &solver, &env(), &artifact(), &CancelToken::new())
            .await
            .unwrap();

        assert!(report.solved());
        assert_eq!(report.attempts.len(), 2);
        assert!(!report.attempts[0].solved);
        assert!(report.attempts[0].patch.is_none());
        assert!(report.attempts[0].stderr.contains("no diff found"));
        assert!(report.attempts[1].solved);
        assert_eq!(report.attempts[1].index, 2);
    }

    #[tokio::test]
    async fn non_applying_patch_consumes_attempt() {
        let sb = scripted();
        seed_buggy(&sb).await;
        let wrong = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a * b
+    return a + b
";
        let solver = SequenceSolver::new(vec![Ok(wrong.to_string())]);
        let looper = SolveLoop::new(1, Duration::from_secs(5), 0);
        let report = looper
            .run(&sb, &solver, &env(), &artifact(), &CancelToken::new())
            .await
            .unwrap();

        assert!(!report.solved());
        assert_eq!(report.attempts.len(), 1);
        assert!(report.attempts[0].patch.is_some());
        assert_eq!(report.attempts[0].tests_passed, 0);
    }

    #[tokio::test]
    async fn attempts_exhaust_without_solve() {
        let sb = scripted();
        seed_buggy(&sb).await;
        let solver = SequenceSolver::new(vec![
            Err(AgentError::Declined("stuck".to_string())),
            Err(AgentError::Declined("still stuck".to_string())),
            Err(AgentError::Declined("hopeless".to_string())),
        ]);
        let looper = SolveLoop::new(3, Duration::from_secs(5), 0);
        let report = looper
            .run(&sb, &solver, &env(), &artifact(), &CancelToken::new())
            .await
            .unwrap();

        assert!(!report.solved());
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(
            report.attempts.iter().map(|a| a.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn cancellation_between_attempts_keeps_finished_attempt() {
        let sb = ScriptedSandbox::with_clean_files(&[("calc.py", CLEAN_CALC)]);
        seed_buggy(&sb).await;
        let cancel = CancelToken::new();
        // The full suite run flips the token mid-attempt; the attempt still
        // finishes and is recorded, and attempt 2 never starts.
        let token = cancel.clone();
        sb.on_command("pytest --all", move |_| {
            token.cancel();
            Ok(ExecOutput::completed(1, "1 failed", ""))
        });
        sb.on_command("pytest", |_| {
            Ok(ExecOutput::completed(1, "1 failed", "AssertionError"))
        });

        let mut environment = env();
        environment.test_command = "pytest --all".to_string();
        let solver = SequenceSolver::new(vec![Ok(FIX_DIFF.to_string()), Ok(FIX_DIFF.to_string())]);
        let looper = SolveLoop::new(4, Duration::from_secs(5), 0);
        let report = looper
            .run(&sb, &solver, &environment, &artifact(), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempts.len(), 1);
        assert!(!report.attempts[0].solved);
    }

    #[tokio::test]
    async fn llm_outage_is_infrastructure_failure() {
        let sb = scripted();
        seed_buggy(&sb).await;
        let solver = SequenceSolver::new(vec![
            Err(AgentError::Llm(LlmError::RequestFailed("x".to_string()))),
            Err(AgentError::Llm(LlmError::RequestFailed("x".to_string()))),
        ]);
        let looper = SolveLoop::new(2, Duration::from_secs(5), 1);
        let err = looper
            .run(&sb, &solver, &env(), &artifact(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EpisodeError::Infrastructure { .. }));
        // Retried once before giving up.
        assert_eq!(solver.calls.load(Ordering::SeqCst), 2);
    }
}
