//! Component G: Vose's alias method for O(1) weighted seed sampling.
//!
//! Grounded in `create_alias_table` in `afl-fuzz-queue.c`. Builds from
//! either per-seed weight (speed-sensitive schedules) or raw perf score
//! (`RARE`, which skips the weight model), normalizing so probabilities
//! sum to `n`.

use crate::corpus::queue::{QueueStore, SeedId};
use crate::rand::Rand;
use crate::schedulers::powersched::PowerSchedule;
use crate::schedulers::testcase_score::{
    calculate_perf_score, compute_weight, CorpusAverages, ScoreContext,
};

/// Per-seed sampling source: either the weight model or the bare perf
/// score, selected by whether the active schedule is `RARE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Weight,
    PerfScore,
}

/// The alias table: `alias_table[i]` is the alternate bucket for slot `i`,
/// `alias_probability[i]` the probability of staying on slot `i`.
#[derive(Debug, Default)]
pub struct AliasTable {
    alias_table: Vec<usize>,
    alias_probability: Vec<f64>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.alias_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alias_table.is_empty()
    }

    /// Rebuilds the table from the current queue state. `n_fuzz` is the
    /// global fuzz-count array indexed by `n_fuzz_entry`; `queued_discovered`
    /// is the count of seeds discovered since the last rebuild, used for
    /// MMOPT's "last 5 discoveries" bonus.
    pub fn rebuild(
        &mut self,
        queue: &mut QueueStore,
        n_fuzz: &[u32],
        schedule: PowerSchedule,
        fixed_seed: bool,
        total_execs: u64,
        max_depth: u32,
        havoc_max_mult: f64,
        queued_discovered: usize,
    ) {
        let n = queue.count();
        self.alias_table = vec![0; n];
        self.alias_probability = vec![0.0; n];
        if n == 0 {
            return;
        }

        let source = if schedule.is_rare() { Source::PerfScore } else { Source::Weight };
        let avg = CorpusAverages::compute(queue, n_fuzz);

        let mut values = vec![0.0f64; n];
        let mut sum = 0.0f64;

        for id in queue.ids() {
            let disabled = queue.get(id).unwrap().disabled;
            if disabled {
                continue;
            }
            let hits = n_fuzz
                .get(queue.get(id).unwrap().n_fuzz_entry)
                .copied()
                .unwrap_or(0);
            let value = match source {
                Source::Weight => compute_weight(queue.get(id).unwrap(), &avg, schedule, hits),
                Source::PerfScore => {
                    let ctx = ScoreContext {
                        schedule,
                        fixed_seed,
                        n_fuzz_hits: hits,
                        total_execs,
                        max_depth,
                        havoc_max_mult,
                        ..Default::default()
                    };
                    let seed = queue.get_mut(id).unwrap();
                    calculate_perf_score(seed, &avg, &ctx)
                }
            };
            values[id.index()] = value;
            sum += value;
        }

        if matches!(source, Source::Weight) && schedule == PowerSchedule::Mmopt && queued_discovered > 0 {
            let cnt = queued_discovered.min(5);
            for idx in (n - cnt)..n {
                if !queue.get(SeedId(idx as u32)).unwrap().disabled {
                    values[idx] *= 2.0;
                }
            }
            sum = values.iter().sum();
        }

        let mut p = vec![0.0f64; n];
        for id in queue.ids() {
            let idx = id.index();
            if queue.get(id).unwrap().disabled || sum <= 0.0 {
                p[idx] = 0.0;
            } else {
                p[idx] = values[idx] * n as f64 / sum;
            }
        }

        self.build_from_probabilities(&p);
    }

    /// Vose's method: partition into small (`P<1`) and large (`P>=1`)
    /// buckets, repeatedly pair one from each until one is exhausted.
    fn build_from_probabilities(&mut self, p: &[f64]) {
        let n = p.len();
        let mut p = p.to_vec();
        let mut small = Vec::with_capacity(n);
        let mut large = Vec::with_capacity(n);

        for (i, &pi) in p.iter().enumerate().rev() {
            if pi < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            self.alias_probability[s] = p[s];
            self.alias_table[s] = l;

            p[l] -= 1.0 - p[s];
            if p[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }

        while let Some(s) = small.pop() {
            self.alias_probability[s] = 1.0;
        }
        while let Some(l) = large.pop() {
            self.alias_probability[l] = 1.0;
        }
    }

    /// Draws a seed id in O(1). Safe to call with a stale table between
    /// rebuilds.
    pub fn draw<R: Rand>(&self, rand: &mut R) -> Option<SeedId> {
        let n = self.alias_table.len();
        if n == 0 {
            return None;
        }
        let s = rand.below(n as u64) as usize;
        let u = rand.next_float();
        let picked = if u < self.alias_probability[s] { s } else { self.alias_table[s] };
        Some(SeedId(picked as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::queue::SeedRecord;
    use crate::rand::StdRand;
    use std::path::PathBuf;

    fn make_seed(queue: &mut QueueStore, exec_us: u64, bitmap_size: u32) -> SeedId {
        let mut s = SeedRecord::new(PathBuf::from("id:x"), 10, 0, None);
        s.exec_us = exec_us;
        s.bitmap_size = bitmap_size;
        s.tc_ref = 1;
        queue.append(s)
    }

    #[test]
    fn disabled_seeds_never_win_a_draw() {
        let mut queue = QueueStore::new();
        let disabled = make_seed(&mut queue, 100, 10);
        let _active = make_seed(&mut queue, 100, 10);
        queue.set_disabled(disabled, true).unwrap();

        let mut table = AliasTable::new();
        let n_fuzz = vec![0u32; 4];
        table.rebuild(&mut queue, &n_fuzz, PowerSchedule::Explore, false, 1, 0, 64.0, 0);

        let mut rand = StdRand::with_seed(1);
        for _ in 0..2000 {
            let picked = table.draw(&mut rand).unwrap();
            assert_ne!(picked, disabled);
        }
    }

    #[test]
    fn faster_seeds_are_sampled_more_often() {
        let mut queue = QueueStore::new();
        let fast = make_seed(&mut queue, 1, 10);
        let slow = make_seed(&mut queue, 100_000, 10);

        let mut table = AliasTable::new();
        let n_fuzz = vec![0u32; 4];
        table.rebuild(&mut queue, &n_fuzz, PowerSchedule::Explore, false, 1, 0, 64.0, 0);

        let mut rand = StdRand::with_seed(7);
        let mut fast_wins = 0;
        let mut slow_wins = 0;
        for _ in 0..5000 {
            match table.draw(&mut rand) {
                Some(id) if id == fast => fast_wins += 1,
                Some(id) if id == slow => slow_wins += 1,
                _ => {}
            }
        }
        assert!(fast_wins > slow_wins);
    }

    #[test]
    fn vose_partition_samples_proportionally_to_input_weights() {
        // Weights [1, 1, 2, 4], sum 8, n 4: probabilities should sum to n
        // and sampling frequency should track weight / sum(weight) within
        // a loose tolerance over a large number of draws.
        let weights = [1.0, 1.0, 2.0, 4.0];
        let sum: f64 = weights.iter().sum();
        let n = weights.len();
        let p: Vec<f64> = weights.iter().map(|w| w * n as f64 / sum).collect();

        let mut table = AliasTable {
            alias_table: vec![0; n],
            alias_probability: vec![0.0; n],
        };
        table.build_from_probabilities(&p);

        let mut rand = StdRand::with_seed(42);
        let mut counts = [0u32; 4];
        let draws = 200_000;
        for _ in 0..draws {
            let picked = table.draw(&mut rand).unwrap();
            counts[picked.index()] += 1;
        }

        let expected = [0.125, 0.125, 0.25, 0.5];
        for (i, &exp) in expected.iter().enumerate() {
            let observed = counts[i] as f64 / draws as f64;
            assert!(
                (observed - exp).abs() < 0.01,
                "bucket {i}: observed {observed}, expected {exp}"
            );
        }
    }

    #[test]
    fn empty_queue_draws_nothing() {
        let mut queue = QueueStore::new();
        let mut table = AliasTable::new();
        let n_fuzz = vec![];
        table.rebuild(&mut queue, &n_fuzz, PowerSchedule::Explore, false, 1, 0, 64.0, 0);
        let mut rand = StdRand::with_seed(1);
        assert!(table.draw(&mut rand).is_none());
    }
}
