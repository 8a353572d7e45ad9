//! End-to-end episode flows against a scripted sandbox and in-memory storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use bugforge::agents::{Injector, SolveRequest, Solver};
use bugforge::config::Settings;
use bugforge::episode::{Episode, EpisodeEvent, EpisodeStatus};
use bugforge::model::{BugArtifact, Environment, InjectionStrategy, LanguageHint, SolverAttempt};
use bugforge::orchestrator::{CancelToken, EpisodeOrchestrator};
use bugforge::sandbox::{ExecOutput, Sandbox, SandboxFactory, ScriptedSandbox};
use bugforge::storage::Database;
use bugforge::{AgentError, SandboxError};

const CLEAN_CALC: &str = "def add(a, b):\n    return a + b\n";
const BUG_DIFF: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a + b
+    return a - b
";
const FIX_DIFF: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";
// Applies cleanly to the buggy tree but does not restore the original.
const WRONG_FIX_DIFF: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return b - a
";

struct FixedInjector {
    artifact: BugArtifact,
}

#[async_trait]
impl Injector for FixedInjector {
    async fn inject(
        &self,
        _env: &Environment,
        strategy: InjectionStrategy,
        seed: u64,
    ) -> Result<BugArtifact, AgentError> {
        let mut artifact = self.artifact.clone();
        artifact.strategy = strategy;
        artifact.seed = seed;
        Ok(artifact)
    }
}

struct FixedSolver {
    patch: String,
}

#[async_trait]
impl Solver for FixedSolver {
    async fn propose_patch(&self, _request: &SolveRequest) -> Result<String, AgentError> {
        Ok(self.patch.clone())
    }
}

struct FixedFactory {
    sandbox: Arc<ScriptedSandbox>,
}

#[async_trait]
impl SandboxFactory for FixedFactory {
    async fn create(&self, _env: &Environment) -> Result<Arc<dyn Sandbox>, SandboxError> {
        Ok(self.sandbox.clone())
    }
}

fn artifact() -> BugArtifact {
    BugArtifact {
        source_file: "calc.py".to_string(),
        test_file: "tests/test_oracle.py".to_string(),
        bug_diff: BUG_DIFF.to_string(),
        oracle_test: "def test_add():\n    assert add(2, 2) == 4\n".to_string(),
        test_command: "pytest tests/test_oracle.py".to_string(),
        strategy: InjectionStrategy::Direct,
        seed: 0,
    }
}

/// Scripted sandbox where every test command keys off whether calc.py still
/// holds its pristine content. Any bug, wrong fix or mutation makes the
/// tests fail, so validation and the solve gates behave like a real suite.
fn scripted() -> Arc<ScriptedSandbox> {
    let sandbox = ScriptedSandbox::with_clean_files(&[("calc.py", CLEAN_CALC)]);
    sandbox.on_command("cat ", |ctx| {
        let path = ctx.command.trim_start_matches("cat ").trim();
        Ok(ExecOutput::completed(
            0,
            ctx.files.get(path).cloned().unwrap_or_default(),
            "",
        ))
    });
    sandbox.on_command("pytest", |ctx| {
        let intact = ctx.files.get("calc.py").map(String::as_str) == Some(CLEAN_CALC);
        if intact {
            Ok(ExecOutput::completed(0, "2 passed", ""))
        } else {
            Ok(ExecOutput::completed(1, "1 failed", "AssertionError"))
        }
    });
    Arc::new(sandbox)
}

async fn setup(
    sandbox: Arc<ScriptedSandbox>,
    solver_patch: &str,
    settings: Settings,
) -> (EpisodeOrchestrator, Database, Environment) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let env = Environment::new("calc", "calc-image:latest", LanguageHint::Python, "pytest");
    db.insert_environment(&env).await.unwrap();

    let orchestrator = EpisodeOrchestrator::new(
        settings,
        db.clone(),
        Arc::new(FixedFactory { sandbox }),
        Arc::new(FixedInjector {
            artifact: artifact(),
        }),
        Arc::new(FixedSolver {
            patch: solver_patch.to_string(),
        }),
    )
    .with_model_id("scripted-model");
    (orchestrator, db, env)
}

#[tokio::test]
async fn solved_episode_earns_full_reward_and_persists() {
    let (orch, db, env) = setup(scripted(), FIX_DIFF, Settings::default()).await;

    let episode = orch
        .run_episode(env.env_id, InjectionStrategy::Direct, 7, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(episode.status, EpisodeStatus::Completed);
    assert_eq!(episode.final_reward, Some(1.0));
    let report = episode.validation_report.as_ref().unwrap();
    assert!(report.passed);
    assert_eq!(report.steps.len(), 7);
    assert_eq!(episode.attempts.len(), 1);
    assert!(episode.attempts[0].solved);
    assert_eq!(episode.model_id.as_deref(), Some("scripted-model"));

    let stored = db.get_episode(episode.episode_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EpisodeStatus::Completed);
    assert_eq!(stored.final_reward, Some(1.0));
    assert_eq!(stored.attempts.len(), 1);
    assert_eq!(stored.strategy, InjectionStrategy::Direct);
    assert_eq!(stored.seed, 7);
}

#[tokio::test]
async fn unobservable_bug_is_rejected_with_zero_reward() {
    // The suite never fails, so the injected bug cannot be observed and
    // validation must stop at the bug-validity step.
    let sandbox = ScriptedSandbox::with_clean_files(&[("calc.py", CLEAN_CALC)]);
    sandbox.on_command("cat ", |ctx| {
        let path = ctx.command.trim_start_matches("cat ").trim();
        Ok(ExecOutput::completed(
            0,
            ctx.files.get(path).cloned().unwrap_or_default(),
            "",
        ))
    });
    sandbox.on_command("pytest", |_ctx| Ok(ExecOutput::completed(0, "2 passed", "")));

    let (orch, db, env) = setup(Arc::new(sandbox), FIX_DIFF, Settings::default()).await;
    let episode = orch
        .run_episode(env.env_id, InjectionStrategy::Direct, 7, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(episode.status, EpisodeStatus::Failed);
    assert_eq!(episode.final_reward, Some(0.0));
    let error = episode.error.as_ref().unwrap();
    assert!(error.starts_with("artifact invalid"), "error: {error}");

    // Fail-fast: the report stops at the first failing step.
    let report = episode.validation_report.as_ref().unwrap();
    assert!(!report.passed);
    assert_eq!(report.steps.len(), 5);
    assert!(report.steps[..4].iter().all(|s| s.passed));
    assert!(!report.steps[4].passed);

    let stored = db.get_episode(episode.episode_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EpisodeStatus::Failed);
    assert_eq!(stored.validation_report.unwrap().steps.len(), 5);
}

#[tokio::test]
async fn exhausted_attempts_complete_with_zero_reward() {
    let settings = Settings::default().with_max_solver_attempts(2);
    let (orch, _db, env) = setup(scripted(), WRONG_FIX_DIFF, settings).await;

    let episode = orch
        .run_episode(env.env_id, InjectionStrategy::Direct, 7, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(episode.status, EpisodeStatus::Completed);
    assert_eq!(episode.final_reward, Some(0.0));
    assert_eq!(episode.attempts.len(), 2);
    assert!(episode.attempts.iter().all(|a| !a.solved));
    assert_eq!(episode.attempts[0].index, 1);
    assert_eq!(episode.attempts[1].index, 2);
}

#[tokio::test]
async fn cancellation_mid_solve_keeps_finished_attempts() {
    let sandbox = ScriptedSandbox::with_clean_files(&[("calc.py", CLEAN_CALC)]);
    sandbox.on_command("cat ", |ctx| {
        let path = ctx.command.trim_start_matches("cat ").trim();
        Ok(ExecOutput::completed(
            0,
            ctx.files.get(path).cloned().unwrap_or_default(),
            "",
        ))
    });
    let cancel = CancelToken::new();
    {
        // Flip the token once a solve attempt runs the full suite. Validation
        // runs the same command on other snapshots and must not trip it.
        // Registered before the generic pytest responder so it matches first.
        let cancel = cancel.clone();
        sandbox.on_command("pytest --all", move |ctx| {
            let intact = ctx.files.get("calc.py").map(String::as_str) == Some(CLEAN_CALC);
            if ctx.snapshot.starts_with("attempt-") {
                cancel.cancel();
            }
            if intact {
                Ok(ExecOutput::completed(0, "2 passed", ""))
            } else {
                Ok(ExecOutput::completed(1, "1 failed", "AssertionError"))
            }
        });
    }
    sandbox.on_command("pytest", |ctx| {
        let intact = ctx.files.get("calc.py").map(String::as_str) == Some(CLEAN_CALC);
        if intact {
            Ok(ExecOutput::completed(0, "2 passed", ""))
        } else {
            Ok(ExecOutput::completed(1, "1 failed", "AssertionError"))
        }
    });

    let db = Database::connect("sqlite::memory:").await.unwrap();
    let env = Environment::new(
        "calc",
        "calc-image:latest",
        LanguageHint::Python,
        "pytest --all",
    );
    db.insert_environment(&env).await.unwrap();
    let orch = EpisodeOrchestrator::new(
        Settings::default(),
        db.clone(),
        Arc::new(FixedFactory {
            sandbox: Arc::new(sandbox),
        }),
        Arc::new(FixedInjector {
            artifact: artifact(),
        }),
        Arc::new(FixedSolver {
            patch: WRONG_FIX_DIFF.to_string(),
        }),
    );

    let episode = orch
        .run_episode(env.env_id, InjectionStrategy::Direct, 7, &cancel)
        .await
        .unwrap();

    assert_eq!(episode.status, EpisodeStatus::Cancelled);
    assert_eq!(episode.final_reward, None);
    assert_eq!(episode.attempts.len(), 1);

    let stored = db.get_episode(episode.episode_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EpisodeStatus::Cancelled);
    assert_eq!(stored.attempts.len(), 1);
}

#[tokio::test]
async fn resume_continues_solving_after_recorded_attempts() {
    let (orch, db, env) = setup(scripted(), FIX_DIFF, Settings::default()).await;

    // A solving episode stranded after one failed attempt, as a crashed run
    // would have left it.
    let mut episode = Episode::new(env.env_id, 3).with_injection(InjectionStrategy::Direct, 7);
    episode.artifact = Some({
        let mut a = artifact();
        a.seed = 7;
        a
    });
    episode.advance(EpisodeEvent::StartRequested).unwrap();
    episode.advance(EpisodeEvent::ArtifactReceived).unwrap();
    episode.advance(EpisodeEvent::ValidationPassed).unwrap();
    episode
        .push_attempt(SolverAttempt::record(
            1,
            Some(WRONG_FIX_DIFF.to_string()),
            "1 failed".to_string(),
            String::new(),
            0,
            2,
            false,
            Utc::now(),
        ))
        .unwrap();
    db.save_episode(&episode).await.unwrap();

    let resumed = orch
        .resume(episode.episode_id, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(resumed.status, EpisodeStatus::Completed);
    assert_eq!(resumed.final_reward, Some(1.0));
    assert_eq!(resumed.attempts.len(), 2);
    assert!(!resumed.attempts[0].solved);
    assert_eq!(resumed.attempts[1].index, 2);
    assert!(resumed.attempts[1].solved);
}

#[tokio::test]
async fn resuming_a_terminal_episode_is_rejected() {
    let (orch, db, env) = setup(scripted(), FIX_DIFF, Settings::default()).await;

    let mut episode = Episode::new(env.env_id, 3);
    episode.advance(EpisodeEvent::CancelRequested).unwrap();
    db.save_episode(&episode).await.unwrap();

    let err = orch
        .resume(episode.episode_id, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, bugforge::EpisodeError::Terminal { .. }));
}
