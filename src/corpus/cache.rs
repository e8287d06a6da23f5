//! Component H: a bounded, randomly-evicted cache of testcase bytes.
//!
//! Mirrors AFL++'s in-memory testcase cache (`afl->q_testcase_cache`): a
//! fixed byte budget and entry-count budget back a best-effort memoization
//! of file contents, with cold slots reloaded from disk on demand rather
//! than tracked precisely (no real LRU bookkeeping — random eviction is
//! cheap and, empirically, good enough).

use std::io;
use std::path::Path;

use crate::corpus::queue::SeedId;
use crate::rand::Rand;

/// Bounded cache from [`SeedId`] to that seed's file contents.
#[derive(Debug)]
pub struct TestcaseCache {
    slots: Vec<Option<Vec<u8>>>,
    total_bytes: usize,
    max_bytes: usize,
    max_entries: usize,
    entry_count: usize,
    /// Lowest index known to be free; advances monotonically, reset to 0
    /// on eviction below it. Accelerates scanning for a slot to reuse.
    smallest_free: usize,
    /// One past the highest index ever occupied.
    max_count: usize,
}

impl TestcaseCache {
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            slots: Vec::new(),
            total_bytes: 0,
            max_bytes,
            max_entries,
            entry_count: 0,
            smallest_free: 0,
            max_count: 0,
        }
    }

    fn ensure_capacity(&mut self, id: SeedId) {
        let idx = id.index();
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
    }

    /// Returns the cached bytes for `id`, loading them from `path` on a
    /// miss. `protect` names a seed (typically the one currently being
    /// executed) that eviction must never touch.
    pub fn get<R: Rand>(
        &mut self,
        id: SeedId,
        path: &Path,
        protect: Option<SeedId>,
        rand: &mut R,
    ) -> io::Result<&[u8]> {
        self.ensure_capacity(id);
        if self.slots[id.index()].is_some() {
            return Ok(self.slots[id.index()].as_deref().unwrap());
        }

        let bytes = std::fs::read(path)?;
        self.make_room_for(bytes.len(), protect, rand);
        self.insert(id, bytes);
        Ok(self.slots[id.index()].as_deref().unwrap())
    }

    /// Caches `bytes` for `id` directly (e.g. right after a mutation was
    /// written to disk), if the budget permits. Silently drops the write
    /// otherwise: the next [`Self::get`] reloads from disk.
    pub fn store_mem(&mut self, id: SeedId, bytes: Vec<u8>) {
        if bytes.len() > self.max_bytes {
            return;
        }
        self.ensure_capacity(id);
        if self.slots[id.index()].is_none() && self.entry_count >= self.max_entries {
            return;
        }
        if self.total_bytes + bytes.len() > self.max_bytes && self.slots[id.index()].is_none() {
            return;
        }
        self.insert(id, bytes);
    }

    /// Drops `id`'s cached bytes, if any, and truncates/pads them to
    /// `new_len` in place rather than evicting — used after a trim pass
    /// rewrites a testcase's on-disk length without changing its identity.
    pub fn retake_after_trim(&mut self, id: SeedId, new_len: usize) {
        let idx = id.index();
        if idx >= self.slots.len() {
            return;
        }
        if let Some(bytes) = self.slots[idx].as_mut() {
            let old_len = bytes.len();
            bytes.resize(new_len, 0);
            self.total_bytes = self.total_bytes + new_len - old_len;
        }
    }

    pub fn contains(&self, id: SeedId) -> bool {
        self.slots
            .get(id.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn insert(&mut self, id: SeedId, bytes: Vec<u8>) {
        let idx = id.index();
        self.total_bytes += bytes.len();
        self.slots[idx] = Some(bytes);
        self.entry_count += 1;
        self.max_count = self.max_count.max(idx + 1);
        if idx == self.smallest_free {
            self.smallest_free = self.next_free_from(idx + 1);
        }
    }

    fn next_free_from(&self, from: usize) -> usize {
        let mut i = from;
        while i < self.slots.len() && self.slots[i].is_some() {
            i += 1;
        }
        i
    }

    fn evict(&mut self, idx: usize) {
        if let Some(bytes) = self.slots[idx].take() {
            self.total_bytes -= bytes.len();
            self.entry_count -= 1;
            if idx < self.smallest_free {
                self.smallest_free = idx;
            }
        }
    }

    /// Evicts uniformly-random occupied, non-protected slots until either
    /// `extra` more bytes fit under the budget or one more entry fits
    /// under the count budget — whichever is tighter.
    fn make_room_for<R: Rand>(&mut self, extra: usize, protect: Option<SeedId>, rand: &mut R) {
        let protect_idx = protect.map(SeedId::index);

        loop {
            let occupied: Vec<usize> = self.slots[..self.max_count]
                .iter()
                .enumerate()
                .filter(|(i, s)| s.is_some() && Some(*i) != protect_idx)
                .map(|(i, _)| i)
                .collect();

            let bytes_ok = self.total_bytes + extra <= self.max_bytes;
            let count_ok = self.entry_count < self.max_entries;
            if bytes_ok && count_ok {
                return;
            }
            if occupied.is_empty() {
                // Nothing left we're allowed to evict; let the caller
                // exceed budget rather than starve.
                return;
            }
            let pick = occupied[rand.below(occupied.len() as u64) as usize];
            self.evict(pick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand::StdRand;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn get_loads_and_caches() {
        let mut cache = TestcaseCache::new(1024, 16);
        let mut rand = StdRand::with_seed(1);
        let f = write_temp(b"hello world");
        let id = SeedId(0);
        let bytes = cache.get(id, f.path(), None, &mut rand).unwrap().to_vec();
        assert_eq!(bytes, b"hello world");
        assert!(cache.contains(id));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn store_mem_drops_when_over_budget() {
        let mut cache = TestcaseCache::new(4, 16);
        cache.store_mem(SeedId(0), vec![0u8; 100]);
        assert!(!cache.contains(SeedId(0)));
    }

    #[test]
    fn eviction_respects_protected_slot() {
        let mut cache = TestcaseCache::new(16, 1);
        let mut rand = StdRand::with_seed(9);
        cache.store_mem(SeedId(0), vec![1, 2, 3, 4]);
        let f = write_temp(b"abcdefgh");
        // Only one entry allowed; protect id 0 so id 1's load must fail to
        // evict it and therefore exceed budget rather than touch it.
        let _ = cache.get(SeedId(1), f.path(), Some(SeedId(0)), &mut rand);
        assert!(cache.contains(SeedId(0)));
    }

    #[test]
    fn retake_after_trim_resizes_in_place() {
        let mut cache = TestcaseCache::new(1024, 16);
        cache.store_mem(SeedId(0), vec![1, 2, 3, 4, 5]);
        cache.retake_after_trim(SeedId(0), 2);
        assert_eq!(cache.total_bytes(), 2);
    }
}
