//! Component C: the top-rated table and favored-set culling.
//!
//! Grounded in `update_bitmap_score` and `cull_queue` in
//! `afl-fuzz-queue.c`. The win condition is spelled out directly as three
//! ordered checks (existing winner absent, or strictly higher fuzz
//! pressure, or equal pressure and strictly higher fav factor) rather than
//! transliterated from the source's two sequential `continue`s, which tie
//! toward the newest seed instead of leaving ties with the incumbent.

use std::path::Path;

use crate::bitmap::BitMap;
use crate::corpus::queue::{QueueStore, SeedId};
use crate::corpus::state_markers::mark_redundant;
use crate::schedulers::powersched::PowerSchedule;

fn next_pow2(x: u64) -> u64 {
    if x <= 1 {
        1
    } else {
        1u64 << (64 - (x - 1).leading_zeros())
    }
}

struct Candidacy {
    fuzz_pressure: u64,
    fav_factor: u64,
}

fn candidacy(
    schedule: PowerSchedule,
    fixed_seed: bool,
    len: usize,
    exec_us: u64,
    fuzz_level: u32,
    n_fuzz_hits: u32,
) -> Candidacy {
    let fuzz_pressure = if schedule.skips_fuzz_pressure() {
        0
    } else if schedule.is_rare() {
        next_pow2(n_fuzz_hits as u64)
    } else {
        fuzz_level as u64
    };
    let fav_factor = if schedule.compares_size_only() || fixed_seed {
        (len as u64) << 2
    } else {
        exec_us * len as u64
    };
    Candidacy { fuzz_pressure, fav_factor }
}

/// `afl->top_rated[]`: for every edge ever seen, the seed currently
/// judged best for it.
#[derive(Debug)]
pub struct TopRatedTable {
    top_rated: Vec<Option<SeedId>>,
}

impl TopRatedTable {
    pub fn new(map_size: usize) -> Self {
        Self {
            top_rated: vec![None; map_size],
        }
    }

    pub fn winner(&self, edge: usize) -> Option<SeedId> {
        self.top_rated[edge]
    }

    /// Contests every edge `trace_bits` hit against the current top-rated
    /// table, installing `candidate_id` where it wins. Returns whether any
    /// edge changed hands (`score_changed`).
    pub fn update_bitmap_score(
        &mut self,
        queue: &mut QueueStore,
        candidate_id: SeedId,
        trace_bits: &[u8],
        n_fuzz: &[u32],
        schedule: PowerSchedule,
        fixed_seed: bool,
    ) -> bool {
        let mut score_changed = false;

        let (c_len, c_exec_us, c_fuzz_level, c_n_fuzz_entry) = {
            let c = queue.require(candidate_id).expect("candidate seed exists");
            (c.len, c.exec_us, c.fuzz_level, c.n_fuzz_entry)
        };
        let candidate = candidacy(
            schedule,
            fixed_seed,
            c_len,
            c_exec_us,
            c_fuzz_level,
            n_fuzz.get(c_n_fuzz_entry).copied().unwrap_or(0),
        );

        for (edge, &byte) in trace_bits.iter().enumerate() {
            if byte == 0 {
                continue;
            }

            let wins = match self.top_rated[edge] {
                None => true,
                Some(prev_id) => {
                    let (p_len, p_exec_us, p_fuzz_level, p_n_fuzz_entry) = {
                        let p = queue.require(prev_id).expect("top-rated seed exists");
                        (p.len, p.exec_us, p.fuzz_level, p.n_fuzz_entry)
                    };
                    let prev = candidacy(
                        schedule,
                        fixed_seed,
                        p_len,
                        p_exec_us,
                        p_fuzz_level,
                        n_fuzz.get(p_n_fuzz_entry).copied().unwrap_or(0),
                    );
                    prev.fuzz_pressure > candidate.fuzz_pressure
                        || (prev.fuzz_pressure == candidate.fuzz_pressure
                            && prev.fav_factor > candidate.fav_factor)
                }
            };

            if !wins {
                continue;
            }

            if let Some(prev_id) = self.top_rated[edge] {
                if prev_id != candidate_id {
                    let prev = queue.require_mut(prev_id).expect("top-rated seed exists");
                    prev.tc_ref -= 1;
                    if prev.tc_ref == 0 {
                        prev.trace_mini = None;
                    }
                }
            }

            self.top_rated[edge] = Some(candidate_id);
            let c = queue.require_mut(candidate_id).expect("candidate seed exists");
            c.tc_ref += 1;
            if c.trace_mini.is_none() {
                c.trace_mini = Some(crate::bitmap::minimize(trace_bits));
            }
            score_changed = true;
        }

        score_changed
    }
}

/// Result of a [`cull_queue`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CullReport {
    pub queued_favored: u32,
    pub pending_favored: u32,
    pub smallest_favored: Option<SeedId>,
}

/// Greedy favored-set culling (`cull_queue`): walk edges in ascending
/// order, claim the first still-uncovered edge's top-rated seed as
/// favored, subtract its coverage, repeat. Idempotent: callers should only
/// invoke this when `score_changed` is set.
///
/// `queue_dir` is the live `<out>/queue` directory: every active seed's
/// `redundant_edges/` marker is created or removed to match its freshly
/// recomputed `fs_redundant` flag before this returns.
pub fn cull_queue(table: &TopRatedTable, queue: &mut QueueStore, map_size: usize, queue_dir: &Path) -> CullReport {
    let mut uncovered = BitMap::new_all_set(map_size);
    let mut report = CullReport::default();

    for seed in queue.iter_mut() {
        seed.favored = false;
    }

    for edge in 0..map_size {
        if !uncovered.test(edge) {
            continue;
        }
        let Some(winner_id) = table.winner(edge) else {
            continue;
        };
        let trace_mini = queue
            .get(winner_id)
            .and_then(|s| s.trace_mini.as_ref())
            .cloned();
        let Some(trace_mini) = trace_mini else {
            continue;
        };

        let winner = queue.get_mut(winner_id).expect("top-rated seed exists");
        if !winner.favored {
            winner.favored = true;
            report.queued_favored += 1;
            if !winner.was_fuzzed {
                report.pending_favored += 1;
                if report
                    .smallest_favored
                    .map(|s| winner_id.index() < s.index())
                    .unwrap_or(true)
                {
                    report.smallest_favored = Some(winner_id);
                }
            }
        }
        uncovered.and_not_assign(&trace_mini);
    }

    for seed in queue.iter_mut() {
        if seed.disabled {
            continue;
        }
        mark_redundant(queue_dir, seed, !seed.favored);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::queue::SeedRecord;
    use std::path::PathBuf;

    fn make_seed(queue: &mut QueueStore, len: usize, exec_us: u64) -> SeedId {
        let name = format!("id:{:06}", queue.count());
        let mut s = SeedRecord::new(PathBuf::from(name), len, 0, None);
        s.exec_us = exec_us;
        queue.append(s)
    }

    #[test]
    fn first_seed_to_hit_an_edge_always_wins_it() {
        let mut queue = QueueStore::new();
        let mut table = TopRatedTable::new(8);
        let id = make_seed(&mut queue, 10, 100);
        let mut trace = vec![0u8; 8];
        trace[1] = 1;
        let n_fuzz = vec![0u32; 4];
        let changed = table.update_bitmap_score(
            &mut queue,
            id,
            &trace,
            &n_fuzz,
            PowerSchedule::Explore,
            false,
            );
        assert!(changed);
        assert_eq!(table.winner(1), Some(id));
        assert_eq!(queue.get(id).unwrap().tc_ref, 1);
    }

    #[test]
    fn faster_seed_displaces_slower_winner() {
        let mut queue = QueueStore::new();
        let mut table = TopRatedTable::new(8);
        let n_fuzz = vec![0u32; 4];
        let slow = make_seed(&mut queue, 10, 1000);
        let mut trace = vec![0u8; 8];
        trace[2] = 1;
        table.update_bitmap_score(&mut queue, slow, &trace, &n_fuzz, PowerSchedule::Explore, false);

        let fast = make_seed(&mut queue, 10, 10);
        table.update_bitmap_score(&mut queue, fast, &trace, &n_fuzz, PowerSchedule::Explore, false);

        assert_eq!(table.winner(2), Some(fast));
        assert_eq!(queue.get(slow).unwrap().tc_ref, 0);
        assert!(queue.get(slow).unwrap().trace_mini.is_none());
    }

    #[test]
    fn exact_tie_does_not_displace_the_incumbent() {
        let mut queue = QueueStore::new();
        let mut table = TopRatedTable::new(8);
        let n_fuzz = vec![0u32; 4];
        let first = make_seed(&mut queue, 10, 100);
        let mut trace = vec![0u8; 8];
        trace[3] = 1;
        table.update_bitmap_score(&mut queue, first, &trace, &n_fuzz, PowerSchedule::Explore, false);

        let tied = make_seed(&mut queue, 10, 100);
        table.update_bitmap_score(&mut queue, tied, &trace, &n_fuzz, PowerSchedule::Explore, false);

        assert_eq!(table.winner(3), Some(first));
    }

    #[test]
    fn three_seeds_with_pairwise_overlapping_coverage_yield_exactly_two_favored() {
        // A covers {0,1}, B covers {1,2}, C covers {0,2}; equal exec_us/len.
        // Any two of the three dominate all edges, so culling must settle
        // on exactly two favored seeds, never three.
        let mut queue = QueueStore::new();
        let mut table = TopRatedTable::new(3);
        let n_fuzz = vec![0u32; 3];

        let a = make_seed(&mut queue, 10, 100);
        let mut trace_a = vec![0u8; 3];
        trace_a[0] = 1;
        trace_a[1] = 1;
        table.update_bitmap_score(&mut queue, a, &trace_a, &n_fuzz, PowerSchedule::Explore, false);

        let b = make_seed(&mut queue, 10, 100);
        let mut trace_b = vec![0u8; 3];
        trace_b[1] = 1;
        trace_b[2] = 1;
        table.update_bitmap_score(&mut queue, b, &trace_b, &n_fuzz, PowerSchedule::Explore, false);

        let c = make_seed(&mut queue, 10, 100);
        let mut trace_c = vec![0u8; 3];
        trace_c[0] = 1;
        trace_c[2] = 1;
        table.update_bitmap_score(&mut queue, c, &trace_c, &n_fuzz, PowerSchedule::Explore, false);

        let dir = tempfile::tempdir().unwrap();
        let report = cull_queue(&table, &mut queue, 3, dir.path());
        assert_eq!(report.queued_favored, 2);
        let favored_count = [a, b, c]
            .iter()
            .filter(|&&id| queue.get(id).unwrap().favored)
            .count();
        assert_eq!(favored_count, 2);
    }

    #[test]
    fn cull_queue_marks_minimal_favored_set() {
        let mut queue = QueueStore::new();
        let mut table = TopRatedTable::new(4);
        let n_fuzz = vec![0u32; 4];

        let a = make_seed(&mut queue, 10, 10);
        let mut trace_a = vec![0u8; 4];
        trace_a[0] = 1;
        trace_a[1] = 1;
        table.update_bitmap_score(&mut queue, a, &trace_a, &n_fuzz, PowerSchedule::Explore, false);

        let b = make_seed(&mut queue, 10, 10);
        let mut trace_b = vec![0u8; 4];
        trace_b[2] = 1;
        table.update_bitmap_score(&mut queue, b, &trace_b, &n_fuzz, PowerSchedule::Explore, false);

        let dir = tempfile::tempdir().unwrap();
        let report = cull_queue(&table, &mut queue, 4, dir.path());
        assert!(queue.get(a).unwrap().favored);
        assert!(queue.get(b).unwrap().favored);
        assert_eq!(report.queued_favored, 2);
        assert!(!queue.get(a).unwrap().fs_redundant);
        let a_marker = dir
            .path()
            .join(".state/redundant_edges")
            .join(&queue.get(a).unwrap().file_name);
        assert!(!a_marker.exists());
    }

    #[test]
    fn cull_queue_writes_a_redundant_marker_for_the_loser() {
        let mut queue = QueueStore::new();
        let mut table = TopRatedTable::new(2);
        let n_fuzz = vec![0u32; 2];

        let a = make_seed(&mut queue, 10, 10);
        let mut trace_a = vec![0u8; 2];
        trace_a[0] = 1;
        trace_a[1] = 1;
        table.update_bitmap_score(&mut queue, a, &trace_a, &n_fuzz, PowerSchedule::Explore, false);

        let b = make_seed(&mut queue, 10, 10);
        let trace_b = vec![0u8; 2];
        table.update_bitmap_score(&mut queue, b, &trace_b, &n_fuzz, PowerSchedule::Explore, false);

        let dir = tempfile::tempdir().unwrap();
        cull_queue(&table, &mut queue, 2, dir.path());
        assert!(queue.get(b).unwrap().fs_redundant);
        let b_marker = dir
            .path()
            .join(".state/redundant_edges")
            .join(&queue.get(b).unwrap().file_name);
        assert!(b_marker.exists());
    }
}
