//! Episode orchestration.
//!
//! Drives one episode through inject → validate → solve → evaluate, advancing
//! the state machine and persisting after every transition so a crashed or
//! interrupted run can be resumed from its recorded status. The orchestrator
//! owns the policy decisions: what counts as an infrastructure failure, how
//! rewards are assigned, and when cancellation takes effect.
//!
//! Reward policy: a completed episode earns 1.0 if any attempt solved the bug
//! and 0.0 otherwise; an episode failed by artifact rejection earns 0.0; a
//! cancelled or infrastructure-failed episode carries no reward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::agents::{Injector, Solver};
use crate::config::Settings;
use crate::episode::{Episode, EpisodeEvent, EpisodeStatus};
use crate::error::{AgentError, EpisodeError};
use crate::model::{BugArtifact, Environment, InjectionStrategy};
use crate::sandbox::{snapshots, with_retries, Sandbox, SandboxFactory};
use crate::solve::SolveLoop;
use crate::storage::Database;
use crate::validator::Validator;

/// Cooperative cancellation flag, checked at phase and attempt boundaries.
///
/// Cancellation never interrupts a running step; whatever finished before the
/// flag was observed stays recorded.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runs episodes end to end against stored environments.
pub struct EpisodeOrchestrator {
    settings: Settings,
    db: Database,
    factory: Arc<dyn SandboxFactory>,
    injector: Arc<dyn Injector>,
    solver: Arc<dyn Solver>,
    model_id: Option<String>,
}

impl EpisodeOrchestrator {
    pub fn new(
        settings: Settings,
        db: Database,
        factory: Arc<dyn SandboxFactory>,
        injector: Arc<dyn Injector>,
        solver: Arc<dyn Solver>,
    ) -> Self {
        Self {
            settings,
            db,
            factory,
            injector,
            solver,
            model_id: None,
        }
    }

    /// Record the model identifier on episodes this orchestrator runs.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Start and drive a fresh episode against an environment.
    pub async fn run_episode(
        &self,
        env_id: Uuid,
        strategy: InjectionStrategy,
        seed: u64,
        cancel: &CancelToken,
    ) -> Result<Episode, EpisodeError> {
        let env = self
            .environment(env_id)
            .await?
            .ok_or_else(|| EpisodeError::EnvironmentNotFound(env_id.to_string()))?;

        let mut episode = Episode::new(env.env_id, self.settings.max_solver_attempts)
            .with_injection(strategy, seed);
        episode.model_id = self.model_id.clone();
        self.persist(&episode).await?;
        tracing::info!(
            episode = %episode.episode_id,
            environment = %env.name,
            strategy = %strategy,
            seed,
            "episode created"
        );

        self.drive(episode, &env, cancel).await
    }

    /// Continue a stranded episode from its recorded status. Attempts already
    /// recorded are kept; solving resumes at the next attempt index.
    pub async fn resume(
        &self,
        episode_id: Uuid,
        cancel: &CancelToken,
    ) -> Result<Episode, EpisodeError> {
        let episode = self
            .db
            .get_episode(episode_id)
            .await
            .map_err(storage)?
            .ok_or_else(|| EpisodeError::NotFound(episode_id.to_string()))?;
        if episode.status.is_terminal() {
            return Err(EpisodeError::Terminal {
                id: episode_id.to_string(),
                status: episode.status.to_string(),
            });
        }
        let env = self
            .environment(episode.env_id)
            .await?
            .ok_or_else(|| EpisodeError::EnvironmentNotFound(episode.env_id.to_string()))?;
        tracing::info!(
            episode = %episode_id,
            status = %episode.status,
            attempts = episode.attempts.len(),
            "resuming episode"
        );

        self.drive(episode, &env, cancel).await
    }

    /// Cancel a stored episode that is not currently being driven.
    pub async fn cancel_episode(&self, episode_id: Uuid) -> Result<Episode, EpisodeError> {
        let mut episode = self
            .db
            .get_episode(episode_id)
            .await
            .map_err(storage)?
            .ok_or_else(|| EpisodeError::NotFound(episode_id.to_string()))?;
        episode.advance(EpisodeEvent::CancelRequested)?;
        self.persist(&episode).await?;
        Ok(episode)
    }

    /// Phase loop. Each arm performs one phase, advances the state machine
    /// and persists before the next phase begins.
    async fn drive(
        &self,
        mut episode: Episode,
        env: &Environment,
        cancel: &CancelToken,
    ) -> Result<Episode, EpisodeError> {
        let mut sandbox: Option<Arc<dyn Sandbox>> = None;

        while !episode.status.is_terminal() {
            if cancel.is_cancelled() {
                episode.advance(EpisodeEvent::CancelRequested)?;
                self.persist(&episode).await?;
                break;
            }

            match episode.status {
                EpisodeStatus::Pending => {
                    episode.advance(EpisodeEvent::StartRequested)?;
                    self.persist(&episode).await?;
                }
                EpisodeStatus::Injecting => {
                    self.phase_inject(&mut episode, env).await?;
                }
                EpisodeStatus::Validating => {
                    let sb = self.sandbox(&mut sandbox, &mut episode, env).await?;
                    let Some(sb) = sb else { break };
                    self.phase_validate(&mut episode, env, sb.as_ref()).await?;
                }
                EpisodeStatus::Solving => {
                    let sb = self.sandbox(&mut sandbox, &mut episode, env).await?;
                    let Some(sb) = sb else { break };
                    self.phase_solve(&mut episode, env, sb.as_ref(), cancel).await?;
                }
                // Terminal statuses never reach here.
                _ => break,
            }
        }

        tracing::info!(
            episode = %episode.episode_id,
            status = %episode.status,
            reward = ?episode.final_reward,
            "episode finished"
        );
        Ok(episode)
    }

    async fn phase_inject(
        &self,
        episode: &mut Episode,
        env: &Environment,
    ) -> Result<(), EpisodeError> {
        match self.inject(env, episode.strategy, episode.seed).await {
            Ok(artifact) => {
                episode.artifact = Some(artifact);
                episode.advance(EpisodeEvent::ArtifactReceived)?;
                self.persist(episode).await
            }
            Err(AgentError::Llm(e)) => {
                self.fail_infra(episode, "injecting", e.to_string()).await
            }
            // Malformed injector output is an artifact failure, not an
            // infrastructure one: the episode fails with zero reward.
            Err(e) => {
                episode.error = Some(format!("artifact invalid: {e}"));
                episode.final_reward = Some(0.0);
                episode.advance(EpisodeEvent::InfrastructureFailed)?;
                self.persist(episode).await
            }
        }
    }

    async fn phase_validate(
        &self,
        episode: &mut Episode,
        env: &Environment,
        sandbox: &dyn Sandbox,
    ) -> Result<(), EpisodeError> {
        let artifact = episode
            .artifact
            .clone()
            .ok_or_else(|| EpisodeError::Storage("validating episode has no artifact".to_string()))?;

        let validator = Validator::new(
            self.settings.validator.clone(),
            self.settings.test_timeout,
            self.settings.infra_retries,
        );
        let report = validator.validate(sandbox, env, &artifact).await;
        let infra = report.first_failure().is_some_and(|s| s.is_infra_failure());
        let rejection = report
            .first_failure()
            .map(|s| format!("artifact invalid: step {} ({}): {}", s.step, s.name, s.message));
        let passed = report.passed;
        episode.validation_report = Some(report);

        if infra {
            episode.error = rejection;
            episode.advance(EpisodeEvent::InfrastructureFailed)?;
        } else if passed {
            episode.advance(EpisodeEvent::ValidationPassed)?;
        } else {
            episode.error = rejection;
            episode.final_reward = Some(0.0);
            episode.advance(EpisodeEvent::ValidationRejected)?;
        }
        self.persist(episode).await
    }

    async fn phase_solve(
        &self,
        episode: &mut Episode,
        env: &Environment,
        sandbox: &dyn Sandbox,
        cancel: &CancelToken,
    ) -> Result<(), EpisodeError> {
        let artifact = episode
            .artifact
            .clone()
            .ok_or_else(|| EpisodeError::Storage("solving episode has no artifact".to_string()))?;

        // Rebuild the buggy snapshot; on resume the container is fresh and
        // the validator's materialization is gone.
        if let Err(e) = self.materialize_buggy(sandbox, &artifact).await {
            return self.fail_infra(episode, "solving", e.to_string()).await;
        }

        let looper = SolveLoop::new(
            episode.max_attempts,
            self.settings.test_timeout,
            self.settings.infra_retries,
        );
        let first_attempt = episode.attempts.len() as u32 + 1;
        let report = match looper
            .run_from(
                sandbox,
                self.solver.as_ref(),
                env,
                &artifact,
                cancel,
                first_attempt,
            )
            .await
        {
            Ok(report) => report,
            Err(EpisodeError::Infrastructure { reason, .. }) => {
                return self.fail_infra(episode, "solving", reason).await;
            }
            Err(e) => return Err(e),
        };

        for attempt in report.attempts {
            episode.push_attempt(attempt)?;
        }
        if report.cancelled {
            episode.advance(EpisodeEvent::CancelRequested)?;
        } else {
            episode.final_reward = Some(episode.compute_reward());
            episode.advance(EpisodeEvent::SolveLoopEnded)?;
        }
        self.persist(episode).await
    }

    /// Fork `clean` into `buggy`, apply the bug diff and drop in the oracle
    /// test. Mirrors what validation step 1 and 2 build up.
    async fn materialize_buggy(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &BugArtifact,
    ) -> Result<(), EpisodeError> {
        let retries = self.settings.infra_retries;
        with_retries(retries, || sandbox.fork(snapshots::CLEAN, snapshots::BUGGY))
            .await
            .map_err(|e| infra("solving", e.to_string()))?;
        with_retries(retries, || {
            sandbox.write_file(snapshots::BUGGY, ".bugforge/bug.diff", &artifact.bug_diff)
        })
        .await
        .map_err(|e| infra("solving", e.to_string()))?;
        let applied = with_retries(retries, || {
            sandbox.exec(
                snapshots::BUGGY,
                "patch -p1 < .bugforge/bug.diff",
                self.settings.test_timeout,
            )
        })
        .await
        .map_err(|e| infra("solving", e.to_string()))?;
        if !applied.success() {
            return Err(infra(
                "solving",
                format!("validated bug diff no longer applies: {}", applied.stderr),
            ));
        }
        with_retries(retries, || {
            sandbox.write_file(snapshots::BUGGY, &artifact.test_file, &artifact.oracle_test)
        })
        .await
        .map_err(|e| infra("solving", e.to_string()))?;
        Ok(())
    }

    /// Call the injector, retrying only LLM transport failures.
    async fn inject(
        &self,
        env: &Environment,
        strategy: InjectionStrategy,
        seed: u64,
    ) -> Result<BugArtifact, AgentError> {
        let mut last = None;
        for retry in 0..=self.settings.infra_retries {
            match self.injector.inject(env, strategy, seed).await {
                Err(AgentError::Llm(e)) => {
                    tracing::warn!(retry, error = %e, "injector LLM call failed, retrying");
                    last = Some(AgentError::Llm(e));
                }
                other => return other,
            }
        }
        Err(last.expect("at least one attempt ran"))
    }

    /// Create the episode's sandbox on first use. A creation failure marks
    /// the episode infrastructure-failed and yields `None`.
    async fn sandbox(
        &self,
        slot: &mut Option<Arc<dyn Sandbox>>,
        episode: &mut Episode,
        env: &Environment,
    ) -> Result<Option<Arc<dyn Sandbox>>, EpisodeError> {
        if let Some(sb) = slot {
            return Ok(Some(sb.clone()));
        }
        match self.factory.create(env).await {
            Ok(sb) => {
                *slot = Some(sb.clone());
                Ok(Some(sb))
            }
            Err(e) => {
                let phase = episode.status.as_str().to_string();
                self.fail_infra(episode, phase, e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn fail_infra(
        &self,
        episode: &mut Episode,
        phase: impl Into<String>,
        reason: String,
    ) -> Result<(), EpisodeError> {
        let phase = phase.into();
        tracing::error!(
            episode = %episode.episode_id,
            phase = %phase,
            reason = %reason,
            "episode failed on infrastructure"
        );
        episode.error = Some(format!("infrastructure failure during {phase}: {reason}"));
        episode.advance(EpisodeEvent::InfrastructureFailed)?;
        self.persist(episode).await
    }

    async fn environment(&self, env_id: Uuid) -> Result<Option<Environment>, EpisodeError> {
        self.db.get_environment(env_id).await.map_err(storage)
    }

    async fn persist(&self, episode: &Episode) -> Result<(), EpisodeError> {
        self.db.save_episode(episode).await.map_err(storage)
    }
}

fn storage(e: crate::storage::DatabaseError) -> EpisodeError {
    EpisodeError::Storage(e.to_string())
}

fn infra(phase: &str, reason: String) -> EpisodeError {
    EpisodeError::Infrastructure {
        phase: phase.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::SandboxError;
    use crate::model::LanguageHint;
    use crate::sandbox::{ExecOutput, ScriptedSandbox};

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

    struct FixedInjector {
        artifact: Result<BugArtifact, String>,
    }

    #[async_trait]
    impl Injector for FixedInjector {
        async fn inject(
            &self,
            _env: &Environment,
            strategy: InjectionStrategy,
            seed: u64,
        ) -> Result<BugArtifact, AgentError> {
            match &self.artifact {
                Ok(a) => {
                    let mut a = a.clone();
                    a.strategy = strategy;
                    a.seed = seed;
                    Ok(a)
                }
                Err(msg) => Err(AgentError::Malformed(msg.clone())),
            }
        }
    }

    struct FixedSolver {
        patch: Option<String>,
    }

    #[async_trait]
    impl Solver for FixedSolver {
        async fn propose_patch(
            &self,
            _request: &crate::agents::SolveRequest,
        ) -> Result<String, AgentError> {
            self.patch
                .clone()
                .ok_or_else(|| AgentError::Malformed("no patch".to_string()))
        }
    }

    struct FixedFactory {
        sandbox: Arc<ScriptedSandbox>,
        fail: bool,
    }

    #[async_trait]
    impl SandboxFactory for FixedFactory {
        async fn create(&self, _env: &Environment) -> Result<Arc<dyn Sandbox>, SandboxError> {
            if self.fail {
                return Err(SandboxError::DaemonUnavailable("no docker".to_string()));
            }
            Ok(self.sandbox.clone())
        }
    }

    fn good_artifact() -> BugArtifact {
        BugArtifact {
            source_file: "calc.py".to_string(),
            test_file: "tests/test_oracle.py".to_string(),
            bug_diff: BUG_DIFF.to_string(),
            oracle_test: "def test_add(): ...".to_string(),
            test_command: "pytest tests/test_oracle.py".to_string(),
            strategy: InjectionStrategy::Direct,
            seed: 0,
        }
    }

    /// Sandbox where the oracle and suite key off whether calc.py is intact.
    fn scripted() -> Arc<ScriptedSandbox> {
        let sb = ScriptedSandbox::with_clean_files(&[("calc.py", CLEAN_CALC)]);
        sb.on_command("cat ", |ctx| {
            let path = ctx.command.trim_start_matches("cat ").trim();
            Ok(ExecOutput::completed(
                0,
                ctx.files.get(path).cloned().unwrap_or_default(),
                "",
            ))
        });
        sb.on_command("pytest", |ctx| {
            let intact = ctx
                .files
                .get("calc.py")
                .is_some_and(|c| c.contains("return a + b"));
            if intact {
                Ok(ExecOutput::completed(0, "all passed", ""))
            } else {
                Ok(ExecOutput::completed(1, "1 failed", "AssertionError"))
            }
        });
        Arc::new(sb)
    }

    async fn orchestrator(
        sandbox: Arc<ScriptedSandbox>,
        injector: FixedInjector,
        solver: FixedSolver,
    ) -> (EpisodeOrchestrator, Environment) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let env = Environment::new("calc", "img", LanguageHint::Python, "pytest");
        db.insert_environment(&env).await.unwrap();
        let orchestrator = EpisodeOrchestrator::new(
            Settings::default(),
            db,
            Arc::new(FixedFactory {
                sandbox,
                fail: false,
            }),
            Arc::new(injector),
            Arc::new(solver),
        );
        (orchestrator, env)
    }

    #[tokio::test]
    async fn full_episode_completes_with_reward_one() {
        let (orch, env) = orchestrator(
            scripted(),
            FixedInjector {
                artifact: Ok(good_artifact()),
            },
            FixedSolver {
                patch: Some(FIX_DIFF.to_string()),
            },
        )
        .await;

        let episode = orch
            .run_episode(env.env_id, InjectionStrategy::Direct, 7, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(episode.status, EpisodeStatus::Completed);
        assert_eq!(episode.final_reward, Some(1.0));
        assert!(episode.validation_report.as_ref().unwrap().passed);
        assert_eq!(episode.attempts.len(), 1);
        assert!(episode.error.is_none());

        // Persisted copy matches.
        let stored = orch
            .db
            .get_episode(episode.episode_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, EpisodeStatus::Completed);
        assert_eq!(stored.final_reward, Some(1.0));
    }

    #[tokio::test]
    async fn malformed_injection_fails_with_zero_reward() {
        let (orch, env) = orchestrator(
            scripted(),
            FixedInjector {
                artifact: Err("missing bug_diff".to_string()),
            },
            FixedSolver { patch: None },
        )
        .await;

        let episode = orch
            .run_episode(env.env_id, InjectionStrategy::Direct, 1, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert_eq!(episode.final_reward, Some(0.0));
        assert!(episode.error.as_ref().unwrap().contains("artifact invalid"));
    }

    #[tokio::test]
    async fn sandbox_creation_failure_marks_infrastructure() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let env = Environment::new("calc", "img", LanguageHint::Python, "pytest");
        db.insert_environment(&env).await.unwrap();
        let orch = EpisodeOrchestrator::new(
            Settings::default(),
            db,
            Arc::new(FixedFactory {
                sandbox: scripted(),
                fail: true,
            }),
            Arc::new(FixedInjector {
                artifact: Ok(good_artifact()),
            }),
            Arc::new(FixedSolver { patch: None }),
        );

        let episode = orch
            .run_episode(env.env_id, InjectionStrategy::Direct, 1, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert_eq!(episode.final_reward, None);
        assert!(episode
            .error
            .as_ref()
            .unwrap()
            .contains("infrastructure failure"));
    }

    #[tokio::test]
    async fn unknown_environment_rejected_up_front() {
        let (orch, _env) = orchestrator(
            scripted(),
            FixedInjector {
                artifact: Ok(good_artifact()),
            },
            FixedSolver { patch: None },
        )
        .await;
        let err = orch
            .run_episode(
                Uuid::new_v4(),
                InjectionStrategy::Direct,
                1,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EpisodeError::EnvironmentNotFound(_)));
    }

    #[tokio::test]
    async fn pre_cancelled_token_cancels_without_reward() {
        let (orch, env) = orchestrator(
            scripted(),
            FixedInjector {
                artifact: Ok(good_artifact()),
            },
            FixedSolver { patch: None },
        )
        .await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let episode = orch
            .run_episode(env.env_id, InjectionStrategy::Direct, 1, &cancel)
            .await
            .unwrap();
        assert_eq!(episode.status, EpisodeStatus::Cancelled);
        assert_eq!(episode.final_reward, None);
    }
}
