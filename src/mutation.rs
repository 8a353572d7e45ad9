//! Seeded mutation engine.
//!
//! Produces candidate bug diffs that are deterministically reproducible from
//! a seed. Used by the validator's inverse-mutation step: random mutations of
//! the clean source that the oracle test must catch. An oracle that passes on
//! most random junk is not specific to the injected bug and gets rejected.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use std::sync::OnceLock;

use crate::model::InjectionStrategy;

/// Mutation strategy tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStrategy {
    /// Swap a comparison or arithmetic operator on one line.
    OperatorFlip,
    /// Nudge an integer literal by one.
    ConstantNudge,
    /// Delete one effectful line.
    LineDrop,
    /// Negate an `if` condition.
    ConditionFlip,
}

impl MutationStrategy {
    pub const ALL: [MutationStrategy; 4] = [
        MutationStrategy::OperatorFlip,
        MutationStrategy::ConstantNudge,
        MutationStrategy::LineDrop,
        MutationStrategy::ConditionFlip,
    ];

    /// The mutation analogue of an injection strategy. Inverse-mutation
    /// checks must not reuse the strategy the real bug was injected with.
    pub fn analogue_of(strategy: InjectionStrategy) -> Option<MutationStrategy> {
        match strategy {
            InjectionStrategy::Direct => Some(MutationStrategy::OperatorFlip),
            InjectionStrategy::RemovalOnly => Some(MutationStrategy::LineDrop),
            InjectionStrategy::HistoryAware => None,
        }
    }

    /// Deterministically pick the strategy for mutation `i`, cycling through
    /// everything except the injection strategy's analogue.
    pub fn for_index(i: usize, avoid: InjectionStrategy) -> MutationStrategy {
        let excluded = Self::analogue_of(avoid);
        let pool: Vec<MutationStrategy> = Self::ALL
            .iter()
            .copied()
            .filter(|s| Some(*s) != excluded)
            .collect();
        pool[i % pool.len()]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperatorFlip => "operator_flip",
            Self::ConstantNudge => "constant_nudge",
            Self::LineDrop => "line_drop",
            Self::ConditionFlip => "condition_flip",
        }
    }
}

/// One generated mutation: a single-hunk unified diff against `path`.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub strategy: MutationStrategy,
    pub diff: String,
    pub description: String,
    /// 1-based line the mutation touches.
    pub line: usize,
}

/// Deterministic source mutator.
///
/// The same (source, strategy, seed) triple always yields the same mutation,
/// which is what makes re-validation of an artifact idempotent.
pub struct MutationEngine;

const OPERATOR_SWAPS: [(&str, &str); 7] = [
    ("==", "!="),
    ("<=", "<"),
    (">=", ">"),
    (" + ", " - "),
    (" * ", " + "),
    ("&&", "||"),
    (" and ", " or "),
];

fn int_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d+)\b").expect("valid regex"))
}

impl MutationEngine {
    /// Generate a mutation of `source` at `path`, or `None` when the file
    /// offers no applicable site for the strategy.
    pub fn mutate(
        path: &str,
        source: &str,
        strategy: MutationStrategy,
        seed: u64,
    ) -> Option<Mutation> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let lines: Vec<&str> = source.lines().collect();

        let (line_idx, replacement, description) = match strategy {
            MutationStrategy::OperatorFlip => {
                let candidates: Vec<(usize, &(&str, &str))> = lines
                    .iter()
                    .enumerate()
                    .flat_map(|(i, l)| {
                        OPERATOR_SWAPS
                            .iter()
                            .filter(|(from, _)| l.contains(from))
                            .map(move |swap| (i, swap))
                    })
                    .collect();
                let (idx, (from, to)) = *candidates.choose(&mut rng)?;
                let mutated = lines[idx].replacen(from, to, 1);
                (idx, Some(mutated), format!("flip '{from}' to '{to}'"))
            }
            MutationStrategy::ConstantNudge => {
                let candidates: Vec<usize> = lines
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| int_literal_re().is_match(l))
                    .map(|(i, _)| i)
                    .collect();
                let idx = *candidates.choose(&mut rng)?;
                let delta: i64 = if rng.gen_bool(0.5) { 1 } else { -1 };
                let mut replaced = false;
                let mutated = int_literal_re()
                    .replace(lines[idx], |caps: &regex::Captures<'_>| {
                        replaced = true;
                        let n: i64 = caps[1].parse().unwrap_or(0);
                        (n + delta).to_string()
                    })
                    .into_owned();
                if !replaced || mutated == lines[idx] {
                    return None;
                }
                (idx, Some(mutated), format!("nudge constant by {delta}"))
            }
            MutationStrategy::LineDrop => {
                let candidates: Vec<usize> = lines
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| is_droppable(l))
                    .map(|(i, _)| i)
                    .collect();
                let idx = *candidates.choose(&mut rng)?;
                (idx, None, "drop line".to_string())
            }
            MutationStrategy::ConditionFlip => {
                let candidates: Vec<usize> = lines
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| {
                        let t = l.trim_start();
                        (t.starts_with("if ") || t.starts_with("elif ")) && t.ends_with(':')
                    })
                    .map(|(i, _)| i)
                    .collect();
                let idx = *candidates.choose(&mut rng)?;
                let line = lines[idx];
                let trimmed = line.trim_start();
                let indent = &line[..line.len() - trimmed.len()];
                let (kw, rest) = if let Some(r) = trimmed.strip_prefix("if ") {
                    ("if", r)
                } else {
                    ("elif", trimmed.strip_prefix("elif ")?)
                };
                let cond = rest.strip_suffix(':')?;
                let mutated = format!("{indent}{kw} not ({cond}):");
                (idx, Some(mutated), "negate condition".to_string())
            }
        };

        let diff = single_hunk_diff(path, &lines, line_idx, replacement.as_deref());
        Some(Mutation {
            strategy,
            diff,
            description,
            line: line_idx + 1,
        })
    }
}

/// Heuristic: lines safe to delete for a LineDrop mutation.
fn is_droppable(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty()
        && !t.starts_with('#')
        && !t.starts_with("//")
        && !t.starts_with("def ")
        && !t.starts_with("fn ")
        && !t.starts_with("class ")
        && !t.starts_with("import ")
        && !t.starts_with("from ")
        && !t.starts_with("use ")
        && !t.ends_with(':')
        && !t.ends_with('{')
        && t != "}"
}

/// Build a single-hunk unified diff replacing (or deleting) one line, with up
/// to two lines of context on each side.
fn single_hunk_diff(
    path: &str,
    lines: &[&str],
    line_idx: usize,
    replacement: Option<&str>,
) -> String {
    const CONTEXT: usize = 2;
    let start = line_idx.saturating_sub(CONTEXT);
    let end = (line_idx + CONTEXT + 1).min(lines.len());
    let old_count = end - start;
    let new_count = if replacement.is_some() {
        old_count
    } else {
        old_count - 1
    };

    let mut body = String::new();
    for (i, line) in lines.iter().enumerate().take(end).skip(start) {
        if i == line_idx {
            body.push_str(&format!("-{line}\n"));
            if let Some(rep) = replacement {
                body.push_str(&format!("+{rep}\n"));
            }
        } else {
            body.push_str(&format!(" {line}\n"));
        }
    }

    format!(
        "--- a/{path}\n+++ b/{path}\n@@ -{},{} +{},{} @@\n{body}",
        start + 1,
        old_count,
        start + 1,
        new_count,
    )
}
