//! Candidate-pair construction and greedy selection with local search.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use crate::score::ScoreBook;
use crate::JobId;
use crate::Pgid;

use super::types::ScoredPair;
use super::types::Target;

/// Builds every candidate pair over the target list (self-pairs only for
/// targets with at least two workers) and the per-job worker counter.
/// Pairs come back sorted by score, highest first.
pub(crate) fn build_pairs(
    targets: &[Target],
    book: &ScoreBook,
) -> (VecDeque<ScoredPair>, HashMap<JobId, i32>) {
    let mut counter: HashMap<JobId, i32> = HashMap::new();
    let mut pairs = VecDeque::new();

    for (i, first) in targets.iter().enumerate() {
        *counter.entry(first.jobid).or_insert(0) += first.worker_num;

        if first.worker_num >= 2 {
            pairs.push_back(ScoredPair {
                first: *first,
                second: *first,
                score: book.score(first.jobid, first.jobid),
            });
        }

        for second in &targets[i + 1..] {
            pairs.push_back(ScoredPair {
                first: *first,
                second: *second,
                score: book.score(first.jobid, second.jobid),
            });
        }
    }

    pairs
        .make_contiguous()
        .sort_by(|a, b| b.score.total_cmp(&a.score));
    (pairs, counter)
}

/// Greedy pair selection followed by a bounded local search.
///
/// Walks `pairs` in their current deque order (rotation between tries is
/// what produces different greedy fixed points), consuming workers from the
/// per-job counter and a per-PGID counter so no process group contributes
/// more workers than it has. Selection stops at `thread_num / 2` pairs.
pub(crate) fn select_pairs(
    pairs: &VecDeque<ScoredPair>,
    mut counter: HashMap<JobId, i32>,
    thread_num: usize,
    book: &ScoreBook,
) -> Vec<ScoredPair> {
    let threshold = thread_num / 2;
    let mut best_pairs: Vec<ScoredPair> = Vec::with_capacity(threshold);
    let mut pgid_counter: HashMap<Pgid, i32> = HashMap::new();

    for pair in pairs {
        let first = pair.first;
        let second = pair.second;

        if first.jobid == second.jobid {
            let available = counter.get(&first.jobid).copied().unwrap_or(0);
            if available < 2 {
                continue;
            }
            let pgid_remaining = first.worker_num - pgid_counter.get(&first.pgid).copied().unwrap_or(0);
            if pgid_remaining < 2 {
                continue;
            }
            let n = (available / 2).min(pgid_remaining / 2);
            if n < 1 {
                continue;
            }

            *counter.entry(first.jobid).or_insert(0) -= n * 2;
            *pgid_counter.entry(first.pgid).or_insert(0) += n * 2;
            for _ in 0..n {
                best_pairs.push(*pair);
            }
        } else {
            let first_available = counter.get(&first.jobid).copied().unwrap_or(0);
            let second_available = counter.get(&second.jobid).copied().unwrap_or(0);
            if first_available < 1 || second_available < 1 {
                continue;
            }
            let first_remaining =
                first.worker_num - pgid_counter.get(&first.pgid).copied().unwrap_or(0);
            let second_remaining =
                second.worker_num - pgid_counter.get(&second.pgid).copied().unwrap_or(0);
            if first_remaining < 1 || second_remaining < 1 {
                continue;
            }
            let n = first_available
                .min(second_available)
                .min(first_remaining)
                .min(second_remaining);
            if n < 1 {
                continue;
            }

            *counter.entry(first.jobid).or_insert(0) -= n;
            *counter.entry(second.jobid).or_insert(0) -= n;
            *pgid_counter.entry(first.pgid).or_insert(0) += n;
            *pgid_counter.entry(second.pgid).or_insert(0) += n;
            for _ in 0..n {
                best_pairs.push(*pair);
            }
        }

        if best_pairs.len() >= threshold {
            best_pairs.truncate(threshold);
            break;
        }
    }

    local_search(&mut best_pairs, book);

    best_pairs.sort_by(|a, b| b.score.total_cmp(&a.score));
    best_pairs
}

/// Two sweeps over all pair-of-pairs, taking whichever of the current
/// pairing and its two swaps scores highest. Score keys that could not be
/// improved are memoized so later sweeps skip them.
fn local_search(best_pairs: &mut [ScoredPair], book: &ScoreBook) {
    let mut no_swaps: HashSet<u64> = HashSet::new();

    for _ in 0..2 {
        for i in 0..best_pairs.len() {
            for j in i + 1..best_pairs.len() {
                let old_score = best_pairs[i].score + best_pairs[j].score;
                let key = old_score.to_bits();
                if no_swaps.contains(&key) {
                    continue;
                }

                let first_first = book.score(best_pairs[i].first.jobid, best_pairs[j].first.jobid);
                let second_second =
                    book.score(best_pairs[i].second.jobid, best_pairs[j].second.jobid);
                let swap_a = first_first + second_second;

                let first_second = book.score(best_pairs[i].first.jobid, best_pairs[j].second.jobid);
                let second_first = book.score(best_pairs[i].second.jobid, best_pairs[j].first.jobid);
                let swap_b = first_second + second_first;

                if old_score >= swap_a && old_score >= swap_b {
                    no_swaps.insert(key);
                } else if swap_a >= old_score && swap_a >= swap_b {
                    let displaced = best_pairs[i].second;
                    best_pairs[i] = ScoredPair {
                        first: best_pairs[i].first,
                        second: best_pairs[j].first,
                        score: first_first,
                    };
                    best_pairs[j] = ScoredPair {
                        first: displaced,
                        second: best_pairs[j].second,
                        score: second_second,
                    };
                } else {
                    let displaced_first = best_pairs[i].first;
                    let displaced_second = best_pairs[i].second;
                    best_pairs[i] = ScoredPair {
                        first: displaced_first,
                        second: best_pairs[j].second,
                        score: first_second,
                    };
                    best_pairs[j] = ScoredPair {
                        first: displaced_second,
                        second: best_pairs[j].first,
                        score: second_first,
                    };
                }
            }
        }
    }
}

/// Rotates the deque so the first pair that differs from the current front
/// (by job identity) becomes the new front. No-op when every pair matches
/// the front.
pub(crate) fn rotate_to_next_distinct(pairs: &mut VecDeque<ScoredPair>) {
    let Some(front) = pairs.front().copied() else {
        return;
    };
    let pos = pairs
        .iter()
        .skip(1)
        .position(|pair| !same_jobs(pair, &front))
        .map(|p| p + 1);
    if let Some(pos) = pos {
        pairs.rotate_left(pos);
    }
}

fn same_jobs(a: &ScoredPair, b: &ScoredPair) -> bool {
    a.first.jobid == b.first.jobid && a.second.jobid == b.second.jobid
}

pub(crate) fn sum_scores(pairs: &[ScoredPair]) -> f64 {
    pairs.iter().map(|p| p.score).sum()
}
