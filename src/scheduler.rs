//! The crate-root [`Scheduler`]: wires Components A-I into the single
//! value a fuzzer driver loop would hold and call between executions.
//!
//! Equivalent to `IndexesLenTimeMinimizerScheduler<StdWeightedScheduler<..>>`
//! composition in `fuzzers/libafl-fuzz/src/fuzzer.rs`, flattened into one
//! concrete type since exactly one scheduler policy is active per run here
//!. "Global mutable scheduler state" (the `score_changed`/
//! `reinit_table` flags `update_bitmap_score`/`cull_queue` set, and
//! Component I's `inited`/`running`/`last_run_ms`) lives on this struct
//! rather than as file-scope statics.

use std::path::Path;

use crate::bitmap::BitMap;
use crate::cfg::SuccessorMap;
use crate::config::SchedulerConfig;
use crate::corpus::cache::TestcaseCache;
use crate::corpus::queue::{QueueStore, SeedId, SeedRecord};
use crate::error::Error;
use crate::minimize::{MinimizerDriver, MinimizerOutcome};
use crate::rand::{Rand, StdRand};
use crate::schedulers::frontier::FrontierTracker;
use crate::schedulers::frontier_cover::schedule_round;
use crate::schedulers::minimizer::{cull_queue, CullReport, TopRatedTable};
use crate::schedulers::weighted::AliasTable;
use crate::text;

/// The seed-scheduling core. Generic over its randomness source purely so
/// tests can plug in a seeded [`StdRand`] deterministically; production
/// code uses the default.
pub struct Scheduler<R: Rand = StdRand> {
    config: SchedulerConfig,
    queue: QueueStore,
    cfg: SuccessorMap,
    virgin_bits: BitMap,
    top_rated: TopRatedTable,
    frontier: Option<FrontierTracker>,
    alias: AliasTable,
    cache: TestcaseCache,
    minimizer: MinimizerDriver,
    rand: R,
    /// Back-indexed by `SeedId`, one slot per seed.
    n_fuzz: Vec<u32>,
    score_changed: bool,
    reinit_table: bool,
    queued_discovered: usize,
    total_execs: u64,
    max_depth: u32,
    last_cull: CullReport,
}

impl Scheduler<StdRand> {
    /// Builds a scheduler seeded from the current time, for production use.
    pub fn new(config: SchedulerConfig, cfg: SuccessorMap) -> Self {
        Self::with_rand(config, cfg, StdRand::with_current_time())
    }
}

impl<R: Rand> Scheduler<R> {
    pub fn with_rand(config: SchedulerConfig, cfg: SuccessorMap, rand: R) -> Self {
        let map_size = config.map_size;
        let frontier = if config.frontier_enabled {
            Some(FrontierTracker::new(map_size))
        } else {
            None
        };
        let cache = TestcaseCache::new(config.cache_max_bytes, config.cache_max_entries);
        Self {
            top_rated: TopRatedTable::new(map_size),
            virgin_bits: BitMap::new_all_set(map_size),
            queue: QueueStore::new(),
            frontier,
            alias: AliasTable::new(),
            cache,
            minimizer: MinimizerDriver::new(),
            rand,
            n_fuzz: Vec::new(),
            score_changed: false,
            reinit_table: false,
            queued_discovered: 0,
            total_execs: 0,
            max_depth: 0,
            last_cull: CullReport::default(),
            config,
            cfg,
        }
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut QueueStore {
        &mut self.queue
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn last_cull(&self) -> CullReport {
        self.last_cull
    }

    /// Recomputes `pending_not_fuzzed`/`pending_favored` by walking the
    /// queue.
    pub fn pending(&self) -> (usize, usize) {
        self.queue.recompute_pending()
    }

    /// Clears the virgin bit for every edge `trace_bits` hit, the way the
    /// execution harness's shared `virgin_bits` map is updated externally
    /// but read by this core. Callers invoke this once per
    /// execution, before or independently of [`Self::add_to_queue`].
    pub fn observe_execution(&mut self, trace_bits: &[u8]) {
        self.total_execs += 1;
        for (edge, &byte) in trace_bits.iter().enumerate() {
            if byte != 0 {
                self.virgin_bits.clear_bit(edge);
            }
        }
    }

    /// Registers a freshly-discovered seed: classifies its text-ness,
    /// contests the top-rated table for every edge it hit, updates the
    /// frontier tracker if active, and primes the testcase cache with its
    /// bytes, the way `add_to_queue` wires a new entry into every
    /// interested subsystem in one pass.
    pub fn add_to_queue(&mut self, mut seed: SeedRecord, trace_bits: &[u8], bytes: &[u8]) -> SeedId {
        seed.len = bytes.len();
        seed.is_ascii = text::classify(bytes);
        seed.n_fuzz_entry = self.n_fuzz.len();

        let id = self.queue.append(seed);
        self.n_fuzz.push(0);
        self.queued_discovered += 1;

        let changed = self.top_rated.update_bitmap_score(
            &mut self.queue,
            id,
            trace_bits,
            &self.n_fuzz,
            self.config.power_schedule,
            self.config.fixed_seed,
        );
        self.score_changed |= changed;

        if let Some(frontier) = self.frontier.as_mut() {
            let seed_mut = self.queue.get_mut(id).expect("just appended");
            frontier.record_seed_coverage(seed_mut, &self.cfg, &self.virgin_bits, trace_bits);
            frontier.detect_changes();
        }

        self.cache.store_mem(id, bytes.to_vec());
        id
    }

    /// Drops per-seed frontier coverage entries that no longer qualify
    /// under the "outer" classification (e.g. another seed made every
    /// remaining successor non-virgin). A periodic scrub pass, not run on
    /// every execution.
    pub fn scrub_frontier(&mut self) {
        let Some(frontier) = self.frontier.as_mut() else { return };
        let ids: Vec<SeedId> = self.queue.active_ids().collect();
        for id in ids {
            let seed = self.queue.get_mut(id).expect("active id exists");
            frontier.recompute_outer(seed, &self.cfg, &self.virgin_bits);
        }
    }

    /// Records that `id` was just picked for mutation (`was_fuzzed`,
    /// `fuzz_level`, and its `n_fuzz` slot all advance together).
    pub fn mark_fuzzed(&mut self, id: SeedId) -> Result<(), Error> {
        let seed = self.queue.require_mut(id)?;
        seed.was_fuzzed = true;
        seed.fuzz_level += 1;
        let entry = seed.n_fuzz_entry;
        if let Some(slot) = self.n_fuzz.get_mut(entry) {
            *slot = slot.saturating_add(1);
        }
        Ok(())
    }

    fn ensure_scheduled(&mut self, queue_dir: &Path) {
        if self.score_changed {
            self.last_cull = cull_queue(&self.top_rated, &mut self.queue, self.config.map_size, queue_dir);
            self.score_changed = false;
            self.reinit_table = true;
        }
        if self.reinit_table {
            self.alias.rebuild(
                &mut self.queue,
                &self.n_fuzz,
                self.config.power_schedule,
                self.config.fixed_seed,
                self.total_execs,
                self.max_depth,
                self.config.havoc_max_mult,
                self.queued_discovered,
            );
            self.reinit_table = false;
            self.queued_discovered = 0;
        }
    }

    /// Requests the next seed to mutate. Under the frontier set-cover
    /// policy this runs a fresh greedy-cover round every call; under
    /// plain favored-culling it draws from the alias table, rebuilding it
    /// first if anything changed since the last draw. `queue_dir` is the
    /// live `<out>/queue` directory a pending cull writes its
    /// `redundant_edges/` markers under.
    pub fn request_seed(&mut self, queue_dir: &Path) -> Option<SeedId> {
        self.ensure_scheduled(queue_dir);
        if let Some(frontier) = &self.frontier {
            let outcome = schedule_round(&mut self.queue, frontier, self.config.tie_break, &mut self.rand)?;
            Some(outcome.rotation_target)
        } else {
            self.alias.draw(&mut self.rand)
        }
    }

    /// Loads `id`'s testcase bytes, from the in-memory cache if present or
    /// from `queue_dir/file_name` otherwise (Component H).
    pub fn get_bytes(&mut self, queue_dir: &Path, id: SeedId, protect: Option<SeedId>) -> std::io::Result<&[u8]> {
        let file_name = self
            .queue
            .get(id)
            .map(|s| s.file_name.clone())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such seed id"))?;
        let path = queue_dir.join(file_name);
        self.cache.get(id, &path, protect, &mut self.rand)
    }

    /// Drives Component I: fires a blocking minimization round if the
    /// configured interval has elapsed, applying its keep-set to the live
    /// queue and requesting a cull + alias rebuild on success.
    pub fn run_minimization_if_due(&mut self, now_ms: u64) -> Option<MinimizerOutcome> {
        let config = self.config.minimizer.clone()?;
        let outcome = self.minimizer.maybe_run(&config, &mut self.queue, &mut self.rand, now_ms);
        if matches!(outcome, MinimizerOutcome::Applied(_)) {
            self.score_changed = true;
            self.reinit_table = true;
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand::StdRand;
    use std::path::PathBuf;

    fn trace_with(edges: &[usize], map_size: usize) -> Vec<u8> {
        let mut t = vec![0u8; map_size];
        for &e in edges {
            t[e] = 1;
        }
        t
    }

    fn seed(name: &str) -> SeedRecord {
        SeedRecord::new(PathBuf::from(name), 0, 0, None)
    }

    #[test]
    fn add_to_queue_classifies_and_sets_len_from_bytes() {
        let config = SchedulerConfig::minimal(16);
        let mut sched = Scheduler::with_rand(config, SuccessorMap::new(16), StdRand::with_seed(1));
        let bytes = b"the quick brown fox jumps over the lazy dog repeatedly".to_vec();
        let trace = trace_with(&[1, 2], 16);
        let id = sched.add_to_queue(seed("id:000000"), &trace, &bytes);
        let rec = sched.queue().get(id).unwrap();
        assert_eq!(rec.len, bytes.len());
        assert_eq!(rec.is_ascii, crate::corpus::queue::TextKind::Ascii);
    }

    #[test]
    fn request_seed_after_two_discoveries_is_never_none() {
        let config = SchedulerConfig::minimal(8);
        let mut sched = Scheduler::with_rand(config, SuccessorMap::new(8), StdRand::with_seed(7));
        sched.add_to_queue(seed("id:000000"), &trace_with(&[0, 1], 8), b"aaaaaaaaaaaaaaaaaaaaaaaaaaa");
        sched.add_to_queue(seed("id:000001"), &trace_with(&[2, 3], 8), b"bbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let dir = tempfile::tempdir().unwrap();
        assert!(sched.request_seed(dir.path()).is_some());
        assert_eq!(sched.last_cull().queued_favored, 2);
    }

    #[test]
    fn mark_fuzzed_advances_fuzz_level_and_n_fuzz() {
        let config = SchedulerConfig::minimal(8);
        let mut sched = Scheduler::with_rand(config, SuccessorMap::new(8), StdRand::with_seed(3));
        let id = sched.add_to_queue(seed("id:000000"), &trace_with(&[0], 8), b"x");
        sched.mark_fuzzed(id).unwrap();
        let rec = sched.queue().get(id).unwrap();
        assert!(rec.was_fuzzed);
        assert_eq!(rec.fuzz_level, 1);
    }

    #[test]
    fn frontier_mode_returns_a_rotation_target() {
        let mut config = SchedulerConfig::minimal(8);
        config.frontier_enabled = true;
        let mut cfg = SuccessorMap::new(8);
        cfg.add_edge(0, 1);
        cfg.add_edge(0, 2);
        let mut sched = Scheduler::with_rand(config, cfg, StdRand::with_seed(11));
        sched.add_to_queue(seed("id:000000"), &trace_with(&[0], 8), b"x");
        let dir = tempfile::tempdir().unwrap();
        assert!(sched.request_seed(dir.path()).is_some());
    }
}
