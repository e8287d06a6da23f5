//! Component B: an append-only, indexed collection of seed records.
//!
//! `struct queue_entry` plus `afl->queue_buf`/`afl->queued_items` in
//! `afl-fuzz-queue.c`'s `add_to_queue`, minus the parts that belong to
//! other subsystems (`skipdet_e` is a different subsystem's bookkeeping
//! this core does not own).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bitmap::BitMap;
use crate::error::Error;

/// Dense index of a seed into the queue store. Equal to the seed's
/// position in the store, forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeedId(pub u32);

impl SeedId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for SeedId {
    fn from(v: u32) -> Self {
        SeedId(v)
    }
}

/// Result of `check_if_text`/`check_if_text_buf`: AFL++ return values 0/1/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TextKind {
    #[default]
    NotText,
    Ascii,
    Utf8,
}

/// One retained input with its recorded coverage and stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRecord {
    pub id: SeedId,
    /// Persistent on-disk base filename, e.g. `id:000123,...`.
    pub file_name: PathBuf,
    /// Parent's depth + 1; 0 for imported/initial seeds.
    pub depth: u32,
    /// Byte length of the testcase.
    pub len: usize,
    /// Microseconds to execute, from calibration.
    pub exec_us: u64,
    /// Edges hit by this seed's own discovery trace (`count_ones` of its
    /// minimized trace), recorded once and kept even after `trace_mini` is
    /// released when `tc_ref` drops to zero.
    pub bitmap_size: u32,
    /// One bit per edge, the minimized form of the discovery trace. Only
    /// present while `tc_ref > 0`; released when the
    /// count hits zero.
    pub trace_mini: Option<BitMap>,

    /// Times this seed has been picked for mutation.
    pub fuzz_level: u32,
    /// Back-index into the scheduler's global `n_fuzz` array.
    pub n_fuzz_entry: usize,
    /// Latecomer bonus, decremented over time by the score model.
    pub handicap: u32,

    pub disabled: bool,
    pub favored: bool,
    pub variable_behavior: bool,
    pub passed_det: bool,
    pub fs_redundant: bool,
    pub was_fuzzed: bool,
    pub is_ascii: TextKind,
    /// Frontier set-cover scheduling: marked once this seed is chosen as
    /// the rotation target under a tie-break policy.
    pub set_favored: bool,
    /// Frontier set-cover scheduling: marked once this seed is selected
    /// into the greedy cover list.
    pub set_covered: bool,

    /// Parent seed, if any (absent for imports).
    pub mother: Option<SeedId>,
    /// Number of edges for which this seed is the current top-rated.
    pub tc_ref: u32,

    /// Frontier edges this seed covers (capped; see `MAX_NODES_PER_SEED`
    /// in `schedulers::frontier`), only populated when the frontier
    /// scheduler is active.
    pub covered_frontier_nodes: Vec<u32>,
}

impl SeedRecord {
    /// Constructs a fresh queue entry the way `add_to_queue` does, before
    /// it is appended to a [`QueueStore`] (which assigns its `id`).
    pub fn new(file_name: PathBuf, len: usize, depth: u32, mother: Option<SeedId>) -> Self {
        Self {
            id: SeedId(0),
            file_name,
            depth,
            len,
            exec_us: 0,
            bitmap_size: 0,
            trace_mini: None,
            fuzz_level: 0,
            n_fuzz_entry: 0,
            handicap: 0,
            disabled: false,
            favored: false,
            variable_behavior: false,
            passed_det: false,
            fs_redundant: false,
            was_fuzzed: false,
            is_ascii: TextKind::NotText,
            set_favored: false,
            set_covered: false,
            mother,
            tc_ref: 0,
            covered_frontier_nodes: Vec::new(),
        }
    }

    /// `favored implies !fs_redundant` expressed as
    /// an assertion helper for tests and debug builds.
    pub fn favored_redundant_consistent(&self) -> bool {
        !self.favored || !self.fs_redundant
    }
}

/// Append-only, contiguous-by-id collection of seed records.
#[derive(Debug, Default)]
pub struct QueueStore {
    seeds: Vec<SeedRecord>,
    active_count: usize,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `seed` to the store, assigning its `id` to its index. The
    /// caller passes an already-built [`SeedRecord`]; its `id` field is
    /// overwritten.
    pub fn append(&mut self, mut seed: SeedRecord) -> SeedId {
        let id = SeedId(self.seeds.len() as u32);
        seed.id = id;
        if !seed.disabled {
            self.active_count += 1;
        }
        self.seeds.push(seed);
        id
    }

    pub fn get(&self, id: SeedId) -> Option<&SeedRecord> {
        self.seeds.get(id.index())
    }

    pub fn get_mut(&mut self, id: SeedId) -> Option<&mut SeedRecord> {
        self.seeds.get_mut(id.index())
    }

    /// Like [`Self::get`], but returns an [`Error::InvalidSeedId`] instead
    /// of `None` for callers that consider a missing id a bug.
    pub fn require(&self, id: SeedId) -> Result<&SeedRecord, Error> {
        self.get(id).ok_or(Error::InvalidSeedId(id.index()))
    }

    pub fn require_mut(&mut self, id: SeedId) -> Result<&mut SeedRecord, Error> {
        self.get_mut(id).ok_or(Error::InvalidSeedId(id.index()))
    }

    pub fn count(&self) -> usize {
        self.seeds.len()
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn iter(&self) -> impl Iterator<Item = &SeedRecord> {
        self.seeds.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SeedRecord> {
        self.seeds.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = SeedId> + '_ {
        (0..self.seeds.len()).map(|i| SeedId(i as u32))
    }

    pub fn active_ids(&self) -> impl Iterator<Item = SeedId> + '_ {
        self.seeds
            .iter()
            .filter(|s| !s.disabled)
            .map(|s| s.id)
    }

    /// Toggles `disabled` on `id` without reindexing, keeping
    /// `active_count` consistent. Returns the previous state.
    pub fn set_disabled(&mut self, id: SeedId, disabled: bool) -> Result<bool, Error> {
        let seed = self.require_mut(id)?;
        let was = seed.disabled;
        if was != disabled {
            seed.disabled = disabled;
            if disabled {
                self.active_count -= 1;
            } else {
                self.active_count += 1;
            }
        }
        Ok(was)
    }

    /// Recomputes `pending_not_fuzzed` and `pending_favored` by walking the
    /// whole queue, the way `apply_filter_to_snapshot` does after a
    /// minimization round.
    pub fn recompute_pending(&self) -> (usize, usize) {
        let mut pending_not_fuzzed = 0;
        let mut pending_favored = 0;
        for seed in &self.seeds {
            if seed.disabled {
                continue;
            }
            if !seed.was_fuzzed {
                pending_not_fuzzed += 1;
                if seed.favored {
                    pending_favored += 1;
                }
            }
        }
        (pending_not_fuzzed, pending_favored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(len: usize) -> SeedRecord {
        SeedRecord::new(PathBuf::from("id:000000"), len, 0, None)
    }

    #[test]
    fn append_assigns_sequential_ids() {
        let mut q = QueueStore::new();
        let a = q.append(seed(10));
        let b = q.append(seed(20));
        assert_eq!(a, SeedId(0));
        assert_eq!(b, SeedId(1));
        assert_eq!(q.count(), 2);
        assert_eq!(q.active_count(), 2);
    }

    #[test]
    fn disabling_does_not_reindex() {
        let mut q = QueueStore::new();
        let a = q.append(seed(1));
        let b = q.append(seed(2));
        q.set_disabled(a, true).unwrap();
        assert_eq!(q.active_count(), 1);
        assert_eq!(q.get(b).unwrap().id, b);
        assert_eq!(q.active_ids().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn recompute_pending_counts_unfuzzed_and_favored() {
        let mut q = QueueStore::new();
        let a = q.append(seed(1));
        let b = q.append(seed(2));
        q.get_mut(b).unwrap().favored = true;
        let (pnf, pf) = q.recompute_pending();
        assert_eq!(pnf, 2);
        assert_eq!(pf, 1);
        let _ = a;
    }

    #[test]
    fn invalid_id_is_an_error_not_a_panic() {
        let q = QueueStore::new();
        assert!(q.require(SeedId(0)).is_err());
    }
}
