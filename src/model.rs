//! Core data model for bugforge.
//!
//! Defines the value types shared across the pipeline: environments, bug
//! artifacts, validation reports and solver attempts. These are plain serde
//! types; all lifecycle logic lives in [`crate::episode`] and
//! [`crate::orchestrator`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Programming language hint for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LanguageHint {
    #[default]
    Unknown,
    Python,
    Javascript,
    Typescript,
    Go,
    Rust,
    Java,
    Cpp,
}

impl LanguageHint {
    /// Default syntax-check command template for this language, with `{file}`
    /// standing for the file under check. `None` when no cheap checker exists.
    pub fn default_syntax_check(&self) -> Option<&'static str> {
        match self {
            Self::Python => Some("python3 -m py_compile {file}"),
            Self::Javascript | Self::Typescript => Some("node --check {file}"),
            Self::Go => Some("gofmt -e {file} > /dev/null"),
            Self::Rust => Some("rustc --edition 2021 --emit=metadata --crate-type lib {file} -o /dev/null"),
            Self::Java | Self::Cpp | Self::Unknown => None,
        }
    }

    /// Parse a language hint from its persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "python" => Some(Self::Python),
            "javascript" => Some(Self::Javascript),
            "typescript" => Some(Self::Typescript),
            "go" => Some(Self::Go),
            "rust" => Some(Self::Rust),
            "java" => Some(Self::Java),
            "cpp" => Some(Self::Cpp),
            _ => None,
        }
    }
}

impl fmt::Display for LanguageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Java => "java",
            Self::Cpp => "cpp",
        };
        f.write_str(s)
    }
}

/// An immutable reference to a codebase snapshot and its execution image.
///
/// Environments are never mutated after creation and may only be deleted
/// while no episode references them (enforced by the storage layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub env_id: Uuid,
    pub name: String,
    /// Docker image reference (local or registry) carrying the codebase.
    pub image_ref: String,
    pub language: LanguageHint,
    /// Command that runs the full existing test suite.
    pub test_command: String,
    /// Optional syntax-check command template with a `{file}` placeholder.
    /// Falls back to the language default when absent.
    pub syntax_check_command: Option<String>,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl Environment {
    /// Create a new environment with a fresh id.
    pub fn new(
        name: impl Into<String>,
        image_ref: impl Into<String>,
        language: LanguageHint,
        test_command: impl Into<String>,
    ) -> Self {
        Self {
            env_id: Uuid::new_v4(),
            name: name.into(),
            image_ref: image_ref.into(),
            language,
            test_command: test_command.into(),
            syntax_check_command: None,
            created_at: Utc::now(),
            notes: None,
        }
    }

    /// Set an explicit syntax-check command template.
    pub fn with_syntax_check(mut self, command: impl Into<String>) -> Self {
        self.syntax_check_command = Some(command.into());
        self
    }

    /// Resolve the syntax-check command for `file`, if any checker is known.
    pub fn syntax_check_for(&self, file: &str) -> Option<String> {
        self.syntax_check_command
            .as_deref()
            .or_else(|| self.language.default_syntax_check())
            .map(|tpl| tpl.replace("{file}", file))
    }
}

/// Bug injection strategy modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStrategy {
    /// Modify existing logic directly (off-by-one, wrong operator).
    Direct,
    /// Only remove code while keeping the repo runnable.
    #[default]
    RemovalOnly,
    /// Revert a historical fix to reintroduce an old bug.
    HistoryAware,
}

impl InjectionStrategy {
    /// Parse a strategy from its persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "removal_only" => Some(Self::RemovalOnly),
            "history_aware" => Some(Self::HistoryAware),
            _ => None,
        }
    }
}

impl fmt::Display for InjectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::RemovalOnly => "removal_only",
            Self::HistoryAware => "history_aware",
        };
        f.write_str(s)
    }
}

/// The injector's output: a bug diff plus its oracle regression test.
///
/// Immutable once attached to an episode; produced exactly once per episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugArtifact {
    /// Primary source file the bug was injected into.
    pub source_file: String,
    /// Path where the oracle test lives in the snapshot.
    pub test_file: String,
    /// Unified diff introducing the bug (code files only).
    pub bug_diff: String,
    /// Full content of the oracle regression test.
    pub oracle_test: String,
    /// Command that runs the oracle test alone.
    pub test_command: String,
    pub strategy: InjectionStrategy,
    /// Generation seed; also drives the inverse-mutation checks.
    pub seed: u64,
}

impl BugArtifact {
    /// Check that every required field is non-empty.
    ///
    /// Injector output missing required fields is an expected-negative,
    /// handled at the narrowest scope.
    pub fn validate_fields(&self) -> Result<(), String> {
        let checks = [
            ("source_file", self.source_file.is_empty()),
            ("test_file", self.test_file.is_empty()),
            ("bug_diff", self.bug_diff.trim().is_empty()),
            ("oracle_test", self.oracle_test.trim().is_empty()),
            ("test_command", self.test_command.trim().is_empty()),
        ];
        for (field, empty) in checks {
            if empty {
                return Err(format!("artifact field '{field}' is empty"));
            }
        }
        Ok(())
    }
}

/// Names of the seven validation steps, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    TestFileExistence,
    ParserValidity,
    OriginalTestsPass,
    BugScope,
    BugValidity,
    TestWeakeningValidity,
    InverseMutationTesting,
}

impl StepName {
    /// All steps in execution order.
    pub const ORDER: [StepName; 7] = [
        StepName::TestFileExistence,
        StepName::ParserValidity,
        StepName::OriginalTestsPass,
        StepName::BugScope,
        StepName::BugValidity,
        StepName::TestWeakeningValidity,
        StepName::InverseMutationTesting,
    ];

    /// 1-based step index.
    pub fn index(&self) -> u8 {
        Self::ORDER.iter().position(|s| s == self).unwrap_or(0) as u8 + 1
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TestFileExistence => "test_file_existence",
            Self::ParserValidity => "parser_validity",
            Self::OriginalTestsPass => "original_tests_pass",
            Self::BugScope => "bug_scope",
            Self::BugValidity => "bug_validity",
            Self::TestWeakeningValidity => "test_weakening_validity",
            Self::InverseMutationTesting => "inverse_mutation_testing",
        };
        f.write_str(s)
    }
}

/// Result of a single validation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-based step index.
    pub step: u8,
    pub name: StepName,
    pub passed: bool,
    pub message: String,
    /// Structured details; carries `{"infra": true}` when the step failed
    /// because it could not execute (timeout, sandbox crash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl StepResult {
    /// Whether this step failed for infrastructure reasons.
    pub fn is_infra_failure(&self) -> bool {
        !self.passed
            && self
                .details
                .as_ref()
                .and_then(|d| d.get("infra"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
    }
}

/// Ordered, fail-fast validation report.
///
/// Step k+1 only appears if steps 1..k all passed; `passed` holds exactly
/// when all seven steps are present and passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub steps: Vec<StepResult>,
    pub passed: bool,
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Build a report from an ordered prefix of step results.
    ///
    /// The report passes only when all seven steps ran and passed.
    pub fn from_steps(steps: Vec<StepResult>) -> Self {
        let total_duration = steps.iter().map(|s| s.duration).sum();
        let passed = steps.len() == StepName::ORDER.len() && steps.iter().all(|s| s.passed);
        Self {
            steps,
            passed,
            total_duration,
            created_at: Utc::now(),
        }
    }

    /// The first failed step, if any.
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| !s.passed)
    }
}

/// One solve-loop iteration.
///
/// Attempts are appended in index order and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverAttempt {
    /// 1-based, contiguous attempt index.
    pub index: u32,
    /// Patch submitted by the solver; `None` when the solver failed to
    /// produce one.
    pub patch: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub solved: bool,
    /// Attempt-local reward: 1.0 when solved, 0.0 otherwise.
    pub reward: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SolverAttempt {
    /// Record a finished attempt; the reward follows `solved`.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        index: u32,
        patch: Option<String>,
        stdout: String,
        stderr: String,
        tests_passed: u32,
        tests_total: u32,
        solved: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            index,
            patch,
            stdout,
            stderr,
            tests_passed,
            tests_total,
            solved,
            reward: if solved { 1.0 } else { 0.0 },
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: StepName, passed: bool) -> StepResult {
        StepResult {
            step: name.index(),
            name,
            passed,
            message: String::new(),
            details: None,
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn report_passes_only_with_all_seven() {
        let all: Vec<_> = StepName::ORDER.iter().map(|n| step(*n, true)).collect();
        assert!(ValidationReport::from_steps(all).passed);

        let six: Vec<_> = StepName::ORDER[..6].iter().map(|n| step(*n, true)).collect();
        assert!(!ValidationReport::from_steps(six).passed);
    }

    #[test]
    fn report_fails_on_any_failed_step() {
        let mut steps: Vec<_> = StepName::ORDER.iter().map(|n| step(*n, true)).collect();
        steps[4].passed = false;
        let report = ValidationReport::from_steps(steps);
        assert!(!report.passed);
        assert_eq!(report.first_failure().unwrap().name, StepName::BugValidity);
    }

    #[test]
    fn step_indices_are_one_based_and_ordered() {
        assert_eq!(StepName::TestFileExistence.index(), 1);
        assert_eq!(StepName::InverseMutationTesting.index(), 7);
    }

    #[test]
    fn infra_tag_detected_in_details() {
        let mut s = step(StepName::OriginalTestsPass, false);
        s.details = Some(serde_json::json!({"infra": true}));
        assert!(s.is_infra_failure());
        s.details = Some(serde_json::json!({"infra": false}));
        assert!(!s.is_infra_failure());
    }

    #[test]
    fn artifact_field_validation() {
        let artifact = BugArtifact {
            source_file: "src/calc.py".to_string(),
            test_file: "tests/test_oracle.py".to_string(),
            bug_diff: "--- a/src/calc.py\n+++ b/src/calc.py\n".to_string(),
            oracle_test: "def test(): pass".to_string(),
            test_command: "pytest tests/test_oracle.py".to_string(),
            strategy: InjectionStrategy::Direct,
            seed: 7,
        };
        assert!(artifact.validate_fields().is_ok());

        let mut broken = artifact;
        broken.oracle_test = "  ".to_string();
        assert!(broken.validate_fields().unwrap_err().contains("oracle_test"));
    }

    #[test]
    fn attempt_reward_follows_solved() {
        let a = SolverAttempt::record(1, None, String::new(), String::new(), 0, 3, false, Utc::now());
        assert_eq!(a.reward, 0.0);
        let b = SolverAttempt::record(2, Some("diff".into()), String::new(), String::new(), 3, 3, true, Utc::now());
        assert_eq!(b.reward, 1.0);
    }

    #[test]
    fn environment_syntax_check_resolution() {
        let env = Environment::new("calc", "python:3.12-slim", LanguageHint::Python, "pytest");
        assert_eq!(
            env.syntax_check_for("src/calc.py").unwrap(),
            "python3 -m py_compile src/calc.py"
        );

        let env = env.with_syntax_check("ruff check {file}");
        assert_eq!(env.syntax_check_for("a.py").unwrap(), "ruff check a.py");

        let env = Environment::new("x", "img", LanguageHint::Unknown, "make test");
        assert!(env.syntax_check_for("a.c").is_none());
    }
}
