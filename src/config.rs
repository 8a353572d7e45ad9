//! Configuration for bugforge.
//!
//! Settings are read from `BUGFORGE_*` environment variables with sensible
//! defaults, so the CLI works out of the box against a local SQLite file and
//! a local Docker daemon.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read an environment variable and parse it, falling back to a default.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Top-level application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database URL for episode/environment persistence.
    pub database_url: String,
    /// Maximum solver attempts per episode (>= 1).
    pub max_solver_attempts: u32,
    /// Wall-clock timeout for a single test-suite run.
    pub test_timeout: Duration,
    /// Bounded retries for infrastructure failures at the point of occurrence.
    pub infra_retries: u32,
    /// Validator policy knobs.
    pub validator: ValidatorSettings,
    /// Solver agent knobs.
    pub solver: SolverSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://bugforge.db?mode=rwc".to_string(),
            max_solver_attempts: 4,
            test_timeout: Duration::from_secs(90),
            infra_retries: 2,
            validator: ValidatorSettings::default(),
            solver: SolverSettings::default(),
        }
    }
}

impl Settings {
    /// Build settings from `BUGFORGE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env::var("BUGFORGE_DATABASE_URL").unwrap_or(defaults.database_url),
            max_solver_attempts: env_or("BUGFORGE_MAX_SOLVER_ATTEMPTS", 4).max(1),
            test_timeout: Duration::from_secs(env_or("BUGFORGE_TEST_TIMEOUT_SEC", 90)),
            infra_retries: env_or("BUGFORGE_INFRA_RETRIES", 2),
            validator: ValidatorSettings::from_env(),
            solver: SolverSettings::default(),
        }
    }

    /// Set the maximum solver attempts (clamped to >= 1).
    pub fn with_max_solver_attempts(mut self, attempts: u32) -> Self {
        self.max_solver_attempts = attempts.max(1);
        self
    }
}

/// Validator policy configuration.
///
/// The inverse-mutation threshold is deliberately explicit and tunable:
/// `mutation_count` seeded mutations are generated and the oracle test must
/// fail on at least `min_kills` of them for step 7 to pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSettings {
    /// Number of inverse mutations generated in step 7.
    pub mutation_count: usize,
    /// Minimum number of mutations the oracle test must fail on.
    pub min_kills: usize,
    /// Concurrency bound for step-7 mutation checks.
    pub mutation_workers: usize,
    /// Path prefixes the bug diff must never touch (step 4 scope policy).
    pub denied_scope_prefixes: Vec<String>,
    /// Exact file names the bug diff must never touch (lockfiles and CI).
    pub denied_scope_files: Vec<String>,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            mutation_count: 5,
            min_kills: 1,
            mutation_workers: 2,
            denied_scope_prefixes: vec![
                "tests/".to_string(),
                "test/".to_string(),
                ".github/".to_string(),
                "ci/".to_string(),
                ".ci/".to_string(),
            ],
            denied_scope_files: vec![
                "Cargo.lock".to_string(),
                "package-lock.json".to_string(),
                "yarn.lock".to_string(),
                "poetry.lock".to_string(),
                "go.sum".to_string(),
                "Makefile".to_string(),
            ],
        }
    }
}

impl ValidatorSettings {
    /// Build validator settings from `BUGFORGE_VALIDATOR_*` env variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mutation_count: env_or("BUGFORGE_VALIDATOR_MUTATION_COUNT", 5).max(1),
            min_kills: env_or("BUGFORGE_VALIDATOR_MIN_KILLS", 1).max(1),
            mutation_workers: env_or("BUGFORGE_VALIDATOR_MUTATION_WORKERS", 2).max(1),
            denied_scope_prefixes: defaults.denied_scope_prefixes,
            denied_scope_files: defaults.denied_scope_files,
        }
    }

    /// Set the mutation count for step 7.
    pub fn with_mutation_count(mut self, count: usize) -> Self {
        self.mutation_count = count.max(1);
        self
    }

    /// Set the minimum kill count for step 7.
    pub fn with_min_kills(mut self, kills: usize) -> Self {
        self.min_kills = kills.max(1);
        self
    }

    /// Set the concurrency bound for step-7 checks.
    pub fn with_mutation_workers(mut self, workers: usize) -> Self {
        self.mutation_workers = workers.max(1);
        self
    }
}

/// Solver agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Sampling temperature for patch generation.
    pub temperature: f64,
    /// Maximum tokens per patch response.
    pub max_tokens: u32,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}
