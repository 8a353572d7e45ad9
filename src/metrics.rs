//! Aggregate metrics over stored episodes.
//!
//! Everything here is computed from persisted episode rows, so the numbers
//! survive restarts and reflect exactly what an operator would see in
//! `episode list`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::episode::{Episode, EpisodeStatus};
use crate::model::StepName;
use crate::storage::{Database, DatabaseError};

/// Pass counts for one validation step across all validated episodes.
#[derive(Debug, Clone, Serialize)]
pub struct StepRate {
    pub step: u8,
    pub name: String,
    /// Episodes whose validation reached this step.
    pub runs: usize,
    pub passes: usize,
}

impl StepRate {
    pub fn rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.passes as f64 / self.runs as f64
        }
    }
}

/// Snapshot of pipeline health.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub total_episodes: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Fraction of validated artifacts that passed all seven steps.
    pub validation_pass_rate: f64,
    /// Fraction of completed episodes where some attempt solved the bug.
    pub solve_rate: f64,
    /// Mean final reward over episodes that carry one.
    pub mean_reward: f64,
    /// Mean attempt count over episodes that ran a solve loop.
    pub mean_attempts: f64,
    pub step_rates: Vec<StepRate>,
}

impl MetricsReport {
    /// Compute metrics from a set of episodes.
    pub fn from_episodes(episodes: &[Episode]) -> Self {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for ep in episodes {
            *by_status.entry(ep.status.as_str().to_string()).or_default() += 1;
        }

        let validated: Vec<_> = episodes
            .iter()
            .filter_map(|e| e.validation_report.as_ref())
            .collect();
        let validation_pass_rate = if validated.is_empty() {
            0.0
        } else {
            validated.iter().filter(|r| r.passed).count() as f64 / validated.len() as f64
        };

        let completed: Vec<_> = episodes
            .iter()
            .filter(|e| e.status == EpisodeStatus::Completed)
            .collect();
        let solve_rate = if completed.is_empty() {
            0.0
        } else {
            completed.iter().filter(|e| e.solved()).count() as f64 / completed.len() as f64
        };

        let rewarded: Vec<f64> = episodes.iter().filter_map(|e| e.final_reward).collect();
        let mean_reward = if rewarded.is_empty() {
            0.0
        } else {
            rewarded.iter().sum::<f64>() / rewarded.len() as f64
        };

        let attempted: Vec<usize> = episodes
            .iter()
            .filter(|e| !e.attempts.is_empty())
            .map(|e| e.attempts.len())
            .collect();
        let mean_attempts = if attempted.is_empty() {
            0.0
        } else {
            attempted.iter().sum::<usize>() as f64 / attempted.len() as f64
        };

        let step_rates = StepName::ORDER
            .iter()
            .map(|name| {
                let reached: Vec<_> = validated
                    .iter()
                    .filter_map(|r| r.steps.iter().find(|s| s.name == *name))
                    .collect();
                StepRate {
                    step: name.index(),
                    name: name.to_string(),
                    runs: reached.len(),
                    passes: reached.iter().filter(|s| s.passed).count(),
                }
            })
            .collect();

        Self {
            total_episodes: episodes.len(),
            by_status,
            validation_pass_rate,
            solve_rate,
            mean_reward,
            mean_attempts,
            step_rates,
        }
    }

    /// Load all episodes and compute metrics.
    pub async fn collect(db: &Database) -> Result<Self, DatabaseError> {
        let episodes = db.list_episodes(None, i64::MAX, 0).await?;
        Ok(Self::from_episodes(&episodes))
    }
}
