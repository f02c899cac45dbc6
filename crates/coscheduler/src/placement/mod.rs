//! Placement scheduler: pair jobs by compatibility, probe candidate
//! configurations by live STP, and commit the best one.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use ipc_monitor::IpcMonitor;
use rand::seq::SliceRandom;
use tracing::debug;
use tracing::info;

use crate::procs::AffinityControl;
use crate::score::ScoreBook;
use crate::score::EMPTY_JOBID;
use crate::topology::CpuTopology;

mod assignment;
mod pairing;
pub mod probe;
pub mod types;

pub use probe::RegionSampler;
pub use probe::StpSampler;
pub use types::Candidate;
pub use types::CpuMask;
pub use types::ScoredPair;
pub use types::Target;

use assignment::assign_cores;
use pairing::build_pairs;
use pairing::rotate_to_next_distinct;
use pairing::select_pairs;
use pairing::sum_scores;

/// Cap on greedy attempts per pass; rotation may keep reproducing the same
/// fixed point.
const MAX_TRIES: usize = 100;

/// Candidate configurations closer than this in total pair score count as
/// duplicates.
const SCORE_EPSILON: f64 = 1e-8;

fn nearly_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < SCORE_EPSILON
}

pub struct PlacementScheduler {
    engine: Arc<IpcMonitor>,
    book: Arc<RwLock<ScoreBook>>,
    topology: CpuTopology,
    affinity: Arc<dyn AffinityControl>,
    sampler: Arc<dyn StpSampler>,
    pass_interval: Duration,
    max_candidates: usize,
    shutdown: Arc<AtomicBool>,
}

impl PlacementScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<IpcMonitor>,
        book: Arc<RwLock<ScoreBook>>,
        topology: CpuTopology,
        affinity: Arc<dyn AffinityControl>,
        sampler: Arc<dyn StpSampler>,
        pass_interval: Duration,
        max_candidates: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            book,
            topology,
            affinity,
            sampler,
            pass_interval,
            max_candidates,
            shutdown,
        }
    }

    /// Pass loop. Runs on a dedicated thread; the shutdown flag is checked
    /// between passes and between candidate probes.
    pub fn run(&self) {
        info!(
            physical_cores = self.topology.physical_cores(),
            logical_cpus = self.topology.logical_cpus(),
            "placement scheduler started"
        );
        'passes: loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.schedule_once();

            let mut remaining = self.pass_interval;
            while !remaining.is_zero() {
                if self.shutdown.load(Ordering::Relaxed) {
                    break 'passes;
                }
                let chunk = remaining.min(Duration::from_secs(1));
                std::thread::sleep(chunk);
                remaining -= chunk;
            }
        }
        info!("placement scheduler stopped");
    }

    /// One scheduling pass: enumerate targets, generate candidate
    /// configurations, probe each, commit the best.
    pub fn schedule_once(&self) {
        let (targets, thread_num) = self.enumerate_targets();
        if thread_num == 0 {
            debug!("no workloads to schedule");
            return;
        }
        debug!(thread_num, targets = targets.len(), "scheduling pass");

        let candidates = {
            let book = self.book.read().expect("poisoned");
            self.build_candidates(&targets, thread_num, &book)
        };
        if candidates.is_empty() {
            debug!("no viable candidate configuration this pass");
            return;
        }

        self.probe_and_commit(&candidates);
    }

    /// Scans the active mask and reads each enrolled slot through the
    /// seqlock, then pads with the sentinel up to a multiple of the
    /// logical-CPU count.
    fn enumerate_targets(&self) -> (Vec<Target>, usize) {
        let region = self.engine.region();
        let mut targets = Vec::new();
        let mut workers: i64 = 0;

        region.for_each_active(|idx| {
            let view = region.slot(idx).read();
            if view.worker_num <= 0 {
                return;
            }
            workers += i64::from(view.worker_num);
            targets.push(Target {
                pgid: view.pgid,
                jobid: view.jobid,
                worker_num: view.worker_num,
            });
        });

        let logical = self.topology.logical_cpus() as i64;
        let remain = (logical - (workers % logical)) % logical;
        targets.push(Target {
            pgid: -1,
            jobid: EMPTY_JOBID,
            worker_num: remain as i32,
        });

        (targets, (workers + remain) as usize)
    }

    /// Up to `max_candidates` distinct greedy fixed points (by rotating
    /// the sorted pair list between tries) plus one random-shuffle
    /// baseline derived from the first fixed point.
    fn build_candidates(
        &self,
        targets: &[Target],
        thread_num: usize,
        book: &ScoreBook,
    ) -> Vec<Candidate> {
        let (mut pairs, counter) = build_pairs(targets, book);
        let threshold = thread_num / 2;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut baseline: Option<Candidate> = None;
        let mut tries = 0;

        while tries < MAX_TRIES && candidates.len() < self.max_candidates {
            tries += 1;

            let best = select_pairs(&pairs, counter.clone(), thread_num, book);
            rotate_to_next_distinct(&mut pairs);

            if best.len() != threshold {
                debug!(
                    selected = best.len(),
                    threshold, "greedy selection came up short, retrying"
                );
                continue;
            }

            if candidates.is_empty() {
                let mut shuffled = best.clone();
                shuffled.shuffle(&mut rand::thread_rng());
                baseline = Some(Candidate {
                    pair_score: sum_scores(&shuffled),
                    masks: assign_cores(&shuffled, &self.topology, book),
                });
            }

            let total = sum_scores(&best);
            if candidates
                .iter()
                .any(|candidate| nearly_equal(candidate.pair_score, total))
            {
                continue;
            }

            debug!(total, candidate = candidates.len(), "new candidate configuration");
            candidates.push(Candidate {
                pair_score: total,
                masks: assign_cores(&best, &self.topology, book),
            });
        }

        candidates.extend(baseline);
        candidates
    }

    /// Applies each candidate in turn, samples its STP, and re-applies the
    /// winner. Returns the committed candidate's index.
    pub fn probe_and_commit(&self, candidates: &[Candidate]) -> Option<usize> {
        let mut best_idx = None;
        let mut best_stp = 0.0;

        for (idx, candidate) in candidates.iter().enumerate() {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }

            self.apply(candidate);
            info!(candidate = idx, "probing configuration");
            let stp = self.sampler.sample();
            debug!(candidate = idx, stp, "probe finished");

            if stp > best_stp {
                best_stp = stp;
                best_idx = Some(idx);
            }
        }

        if let Some(idx) = best_idx {
            info!(candidate = idx, stp = best_stp, "committing configuration");
            self.apply(&candidates[idx]);
        }
        best_idx
    }

    fn apply(&self, candidate: &Candidate) {
        for (pgid, mask) in &candidate.masks {
            self.affinity.apply(*pgid, mask);
        }
    }
}
