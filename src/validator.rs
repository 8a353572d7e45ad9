//! Seven-step artifact validation pipeline.
//!
//! Runs the ordered, fail-fast checks that decide whether an injected bug
//! artifact is usable for a solve loop. Step k+1 only runs when steps 1..k
//! all passed, so a report's step list is always a prefix of the full order.
//!
//! A step that *cannot execute* (sandbox transport down, snapshot missing) is
//! recorded as a failed step tagged `{"infra": true}` in its details, which
//! the orchestrator maps to an infrastructure failure rather than an
//! artifact rejection. Every sandbox call is retried a bounded number of
//! times before that tag is emitted.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::config::ValidatorSettings;
use crate::diff;
use crate::error::SandboxError;
use crate::model::{BugArtifact, Environment, StepName, StepResult, ValidationReport};
use crate::mutation::{MutationEngine, MutationStrategy};
use crate::sandbox::{snapshots, validate_rel_path, with_retries, Sandbox};
use crate::utils::tail;

/// Path inside a snapshot where the bug diff is staged before applying.
const BUG_DIFF_PATH: &str = ".bugforge/bug.diff";
/// Path inside a mutation snapshot where the mutation diff is staged.
const MUT_DIFF_PATH: &str = ".bugforge/mut.diff";
/// Scratch snapshot used to run the oracle against clean code.
const ORACLE_CHECK: &str = "oracle-check";

/// Per-step outcome before it is timed and numbered.
struct Outcome {
    passed: bool,
    message: String,
    details: Option<Value>,
}

impl Outcome {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validates one artifact against one sandbox.
///
/// Validation is idempotent: it only reads the `clean` snapshot, rebuilds
/// `buggy` from scratch, and removes its scratch snapshots afterwards, so
/// running it twice over the same artifact yields the same report.
pub struct Validator {
    settings: ValidatorSettings,
    test_timeout: std::time::Duration,
    infra_retries: u32,
}

impl Validator {
    pub fn new(
        settings: ValidatorSettings,
        test_timeout: std::time::Duration,
        infra_retries: u32,
    ) -> Self {
        Self {
            settings,
            test_timeout,
            infra_retries,
        }
    }

    /// Run the full pipeline, stopping at the first failed step.
    ///
    /// On success the sandbox is left with a materialized `buggy` snapshot
    /// (bug applied, oracle test in place) ready for the solve loop.
    pub async fn validate(
        &self,
        sandbox: &dyn Sandbox,
        env: &Environment,
        artifact: &BugArtifact,
    ) -> ValidationReport {
        let mut steps = Vec::new();

        for name in StepName::ORDER {
            let started = Instant::now();
            let outcome = self.dispatch(name, sandbox, env, artifact).await;
            let result = match outcome {
                Ok(o) => StepResult {
                    step: name.index(),
                    name,
                    passed: o.passed,
                    message: o.message,
                    details: o.details,
                    duration: started.elapsed(),
                },
                Err(e) => StepResult {
                    step: name.index(),
                    name,
                    passed: false,
                    message: format!("infrastructure failure: {e}"),
                    details: Some(json!({"infra": true, "error": e.to_string()})),
                    duration: started.elapsed(),
                },
            };

            tracing::info!(
                step = result.step,
                name = %result.name,
                passed = result.passed,
                message = %result.message,
                "validation step finished"
            );
            let passed = result.passed;
            steps.push(result);
            if !passed {
                break;
            }
        }

        ValidationReport::from_steps(steps)
    }

    async fn dispatch(
        &self,
        name: StepName,
        sandbox: &dyn Sandbox,
        env: &Environment,
        artifact: &BugArtifact,
    ) -> Result<Outcome, SandboxError> {
        match name {
            StepName::TestFileExistence => self.check_test_file(sandbox, artifact).await,
            StepName::ParserValidity => self.check_parser(sandbox, env, artifact).await,
            StepName::OriginalTestsPass => self.check_clean_suite(sandbox, env).await,
            StepName::BugScope => Ok(self.check_scope(artifact)),
            StepName::BugValidity => self.check_bug_validity(sandbox, artifact).await,
            StepName::TestWeakeningValidity => self.check_weakening(sandbox, artifact).await,
            StepName::InverseMutationTesting => self.check_mutations(sandbox, artifact).await,
        }
    }

    /// Step 1: paths are sane, the bugged source file exists in the clean
    /// snapshot, and the oracle test lands where the artifact says it does.
    ///
    /// Also rebuilds `buggy` as a fresh fork of `clean` so later steps (and
    /// re-validation) always start from the same state.
    async fn check_test_file(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &BugArtifact,
    ) -> Result<Outcome, SandboxError> {
        for path in [&artifact.source_file, &artifact.test_file] {
            if validate_rel_path(path).is_err() {
                return Ok(Outcome::fail(format!("invalid artifact path '{path}'")));
            }
        }

        let source_exists = with_retries(self.infra_retries, || {
            sandbox.file_exists(snapshots::CLEAN, &artifact.source_file)
        })
        .await?;
        if !source_exists {
            return Ok(Outcome::fail(format!(
                "source file '{}' not found in clean snapshot",
                artifact.source_file
            )));
        }

        with_retries(self.infra_retries, || {
            sandbox.fork(snapshots::CLEAN, snapshots::BUGGY)
        })
        .await?;
        with_retries(self.infra_retries, || {
            sandbox.write_file(snapshots::BUGGY, &artifact.test_file, &artifact.oracle_test)
        })
        .await?;
        let test_exists = with_retries(self.infra_retries, || {
            sandbox.file_exists(snapshots::BUGGY, &artifact.test_file)
        })
        .await?;
        if !test_exists {
            return Ok(Outcome::fail(format!(
                "oracle test '{}' missing after write",
                artifact.test_file
            )));
        }
        Ok(Outcome::pass("oracle test present in buggy snapshot"))
    }

    /// Step 2: the bug diff parses, applies cleanly to the buggy snapshot,
    /// and every touched file still passes the environment's syntax check.
    ///
    /// When no syntax checker is known for the environment the parse-and-apply
    /// checks alone decide the step.
    async fn check_parser(
        &self,
        sandbox: &dyn Sandbox,
        env: &Environment,
        artifact: &BugArtifact,
    ) -> Result<Outcome, SandboxError> {
        let patches = match diff::parse(&artifact.bug_diff) {
            Ok(p) => p,
            Err(e) => return Ok(Outcome::fail(format!("bug diff malformed: {e}"))),
        };

        with_retries(self.infra_retries, || {
            sandbox.write_file(snapshots::BUGGY, BUG_DIFF_PATH, &artifact.bug_diff)
        })
        .await?;
        let apply_cmd = format!("patch -p1 < {BUG_DIFF_PATH}");
        let apply = with_retries(self.infra_retries, || {
            sandbox.exec(snapshots::BUGGY, &apply_cmd, self.test_timeout)
        })
        .await?;
        if !apply.success() {
            return Ok(
                Outcome::fail("bug diff does not apply to clean snapshot").with_details(json!({
                    "exit_code": apply.exit_code,
                    "stderr": tail(&apply.stderr, 1000),
                })),
            );
        }

        for patch in &patches {
            let Some(check) = env.syntax_check_for(&patch.path) else {
                continue;
            };
            let out = with_retries(self.infra_retries, || {
                sandbox.exec(snapshots::BUGGY, &check, self.test_timeout)
            })
            .await?;
            if !out.success() {
                return Ok(Outcome::fail(format!(
                    "syntax check failed for '{}' after bug applied",
                    patch.path
                ))
                .with_details(json!({
                    "command": check,
                    "exit_code": out.exit_code,
                    "stderr": tail(&out.stderr, 1000),
                })));
            }
        }
        Ok(Outcome::pass("bug diff applies and touched files parse"))
    }

    /// Step 3: the pre-existing test suite passes on the clean snapshot.
    async fn check_clean_suite(
        &self,
        sandbox: &dyn Sandbox,
        env: &Environment,
    ) -> Result<Outcome, SandboxError> {
        let out = with_retries(self.infra_retries, || {
            sandbox.exec(snapshots::CLEAN, &env.test_command, self.test_timeout)
        })
        .await?;
        if out.timed_out {
            return Ok(Outcome::fail("test suite timed out on clean snapshot"));
        }
        if !out.success() {
            return Ok(
                Outcome::fail("test suite fails on clean snapshot").with_details(json!({
                    "exit_code": out.exit_code,
                    "output": tail(&out.combined_output(), 2000),
                })),
            );
        }
        Ok(Outcome::pass("test suite passes on clean snapshot"))
    }

    /// Step 4: structural scope check over the parsed diff. The bug may only
    /// touch production code: never the oracle test, test directories, CI
    /// configuration or lockfiles.
    fn check_scope(&self, artifact: &BugArtifact) -> Outcome {
        let touched = diff::touched_files(&artifact.bug_diff);
        if touched.is_empty() {
            return Outcome::fail("bug diff touches no files");
        }

        let offenders: Vec<&String> = touched
            .iter()
            .filter(|path| {
                let base = path.rsplit('/').next().unwrap_or(path);
                *path == &artifact.test_file
                    || self
                        .settings
                        .denied_scope_prefixes
                        .iter()
                        .any(|p| path.starts_with(p.as_str()))
                    || self
                        .settings
                        .denied_scope_files
                        .iter()
                        .any(|f| f == base)
            })
            .collect();

        if offenders.is_empty() {
            Outcome::pass(format!("bug touches {} in-scope file(s)", touched.len()))
        } else {
            Outcome::fail("bug diff touches out-of-scope files")
                .with_details(json!({ "offenders": offenders }))
        }
    }

    /// Step 5: the oracle test must fail on the buggy snapshot. A passing
    /// oracle means the bug has no observable effect; a timeout is rejected
    /// as well because the solve loop could never get a clean signal from it.
    async fn check_bug_validity(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &BugArtifact,
    ) -> Result<Outcome, SandboxError> {
        let out = with_retries(self.infra_retries, || {
            sandbox.exec(snapshots::BUGGY, &artifact.test_command, self.test_timeout)
        })
        .await?;
        if out.timed_out {
            return Ok(Outcome::fail("oracle test timed out on buggy snapshot"));
        }
        if out.success() {
            return Ok(Outcome::fail(
                "oracle test passes on buggy snapshot; bug is not observable",
            ));
        }
        Ok(
            Outcome::pass("oracle test fails on buggy snapshot").with_details(json!({
                "exit_code": out.exit_code,
                "output": tail(&out.combined_output(), 2000),
            })),
        )
    }

    /// Step 6: the oracle test must pass against clean code, caught in a
    /// scratch fork so the clean snapshot itself stays pristine.
    async fn check_weakening(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &BugArtifact,
    ) -> Result<Outcome, SandboxError> {
        let _ = sandbox.remove(ORACLE_CHECK).await;
        with_retries(self.infra_retries, || {
            sandbox.fork(snapshots::CLEAN, ORACLE_CHECK)
        })
        .await?;
        with_retries(self.infra_retries, || {
            sandbox.write_file(ORACLE_CHECK, &artifact.test_file, &artifact.oracle_test)
        })
        .await?;
        let out = with_retries(self.infra_retries, || {
            sandbox.exec(ORACLE_CHECK, &artifact.test_command, self.test_timeout)
        })
        .await?;
        let _ = sandbox.remove(ORACLE_CHECK).await;

        if out.timed_out {
            return Ok(Outcome::fail("oracle test timed out on clean snapshot"));
        }
        if !out.success() {
            return Ok(Outcome::fail(
                "oracle test fails on clean snapshot; test is broken or over-fit",
            )
            .with_details(json!({
                "exit_code": out.exit_code,
                "output": tail(&out.combined_output(), 2000),
            })));
        }
        Ok(Outcome::pass("oracle test passes on clean snapshot"))
    }

    /// Step 7: inverse mutation testing. Seeds `mutation_count` deterministic
    /// mutations of the bugged source file (never using the injection
    /// strategy's own analogue), runs the oracle against each, and requires
    /// at least `min_kills` failures. An oracle that survives every mutation
    /// asserts nothing about the code it claims to cover.
    ///
    /// Checks run concurrently up to `mutation_workers` and stop as soon as
    /// the verdict is decided either way.
    async fn check_mutations(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &BugArtifact,
    ) -> Result<Outcome, SandboxError> {
        let read_cmd = format!("cat {}", artifact.source_file);
        let read = with_retries(self.infra_retries, || {
            sandbox.exec(snapshots::CLEAN, &read_cmd, self.test_timeout)
        })
        .await?;
        if !read.success() {
            return Err(SandboxError::ExecTransport(format!(
                "cannot read '{}' from clean snapshot",
                artifact.source_file
            )));
        }
        let source = read.stdout;

        let candidates: Vec<(usize, crate::mutation::Mutation)> = (0..self.settings.mutation_count)
            .filter_map(|i| {
                let strategy = MutationStrategy::for_index(i, artifact.strategy);
                MutationEngine::mutate(
                    &artifact.source_file,
                    &source,
                    strategy,
                    artifact.seed.wrapping_add(i as u64),
                )
                .map(|m| (i, m))
            })
            .collect();

        if candidates.is_empty() {
            // Nothing to mutate (tiny file, no applicable sites). Inconclusive
            // rather than a rejection.
            return Ok(Outcome::pass("no applicable mutation sites; skipped"));
        }

        let total = candidates.len();
        let jobs = candidates
            .into_iter()
            .map(|(i, m)| self.kill_check(sandbox, artifact, snapshots::mutation(i), m));
        let mut checks = stream::iter(jobs).buffer_unordered(self.settings.mutation_workers);

        let mut kills = 0usize;
        let mut done = 0usize;
        let mut infra: Option<SandboxError> = None;
        while let Some(result) = checks.next().await {
            done += 1;
            match result {
                Ok(true) => kills += 1,
                Ok(false) => {}
                Err(e) => {
                    infra = Some(e);
                    break;
                }
            }
            // Decided either way: enough kills, or not enough checks left.
            if kills >= self.settings.min_kills
                || kills + (total - done) < self.settings.min_kills
            {
                break;
            }
        }
        drop(checks);

        for i in 0..self.settings.mutation_count {
            let _ = sandbox.remove(&snapshots::mutation(i)).await;
        }

        if let Some(e) = infra {
            return Err(e);
        }
        let details = json!({
            "mutations": total,
            "checked": done,
            "kills": kills,
            "min_kills": self.settings.min_kills,
        });
        if kills >= self.settings.min_kills {
            Ok(Outcome::pass(format!(
                "oracle killed {kills}/{done} mutation(s)"
            ))
            .with_details(details))
        } else {
            Ok(Outcome::fail(format!(
                "oracle killed {kills} mutation(s), needs {}",
                self.settings.min_kills
            ))
            .with_details(details))
        }
    }

    /// Run one mutation kill check in its own snapshot. Returns whether the
    /// oracle failed (killed the mutant). A mutation diff that does not apply
    /// counts as not killed.
    async fn kill_check(
        &self,
        sandbox: &dyn Sandbox,
        artifact: &BugArtifact,
        snapshot: String,
        mutation: crate::mutation::Mutation,
    ) -> Result<bool, SandboxError> {
        let _ = sandbox.remove(&snapshot).await;
        with_retries(self.infra_retries, || {
            sandbox.fork(snapshots::CLEAN, &snapshot)
        })
        .await?;
        with_retries(self.infra_retries, || {
            sandbox.write_file(&snapshot, MUT_DIFF_PATH, &mutation.diff)
        })
        .await?;
        let apply_cmd = format!("patch -p1 < {MUT_DIFF_PATH}");
        let applied = with_retries(self.infra_retries, || {
            sandbox.exec(&snapshot, &apply_cmd, self.test_timeout)
        })
        .await?;
        if !applied.success() {
            tracing::debug!(
                snapshot = %snapshot,
                strategy = mutation.strategy.as_str(),
                "mutation diff did not apply"
            );
            return Ok(false);
        }
        with_retries(self.infra_retries, || {
            sandbox.write_file(&snapshot, &artifact.test_file, &artifact.oracle_test)
        })
        .await?;
        let out = with_retries(self.infra_retries, || {
            sandbox.exec(&snapshot, &artifact.test_command, self.test_timeout)
        })
        .await?;
        Ok(!out.timed_out && out.exit_code != 0)
    }
}
