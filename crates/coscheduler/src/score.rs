//! Score oracle state: pairwise compatibility scores and per-job baseline
//! IPC. Populated by the offline pipeline through the control surface;
//! read by the placement scheduler between mutations.

use std::collections::HashMap;

use serde::Serialize;

use crate::JobId;

/// Job id of the sentinel target used to pad the worker count up to a
/// multiple of the logical-CPU count. Never written to affinity.
pub const EMPTY_JOBID: JobId = -1;

/// Packs an unordered jobid pair into one key. `score(a, b) == score(b, a)`
/// falls out of the ordering.
fn pair_key(a: JobId, b: JobId) -> u64 {
    let (a, b) = (a as u32, b as u32);
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    (u64::from(lo) << 32) | u64::from(hi)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreEntry {
    pub jobid1: JobId,
    pub jobid2: JobId,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct ScoreBook {
    scores: HashMap<u64, f64>,
    baselines: HashMap<JobId, f64>,
}

impl ScoreBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_score(&mut self, a: JobId, b: JobId, score: f64) {
        self.scores.insert(pair_key(a, b), score);
    }

    /// Compatibility score for an unordered job pair. Pairs the oracle has
    /// not been fed yet score 0.0 (no affinity preference).
    pub fn score(&self, a: JobId, b: JobId) -> f64 {
        self.scores.get(&pair_key(a, b)).copied().unwrap_or(0.0)
    }

    pub fn update_baseline(&mut self, jobid: JobId, ipc: f64) {
        self.baselines.insert(jobid, ipc);
    }

    /// Standalone IPC of a job, if known.
    pub fn baseline_ipc(&self, jobid: JobId) -> Option<f64> {
        self.baselines.get(&jobid).copied()
    }

    /// Every score entry, for the control surface dump.
    pub fn entries(&self) -> Vec<ScoreEntry> {
        self.scores
            .iter()
            .map(|(&key, &score)| ScoreEntry {
                jobid1: (key >> 32) as u32 as JobId,
                jobid2: key as u32 as JobId,
                score,
            })
            .collect()
    }
}
