//! Sharded set of canonical URLs already admitted to the run.

use parking_lot::Mutex;
use std::collections::HashSet;

const DEFAULT_SHARDS: usize = 64;

/// Once a canonical URL is admitted it is never re-enqueued for this run.
/// The membership check and the insert happen in one critical section per
/// shard, so two workers racing on the same URL cannot both see "new".
pub struct Deduper {
    shards: Vec<Mutex<HashSet<String>>>,
}

impl Deduper {
    pub fn new(shards: usize) -> Self {
        let shards = if shards == 0 { DEFAULT_SHARDS } else { shards };
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    /// Returns true when the canonical URL was already present, inserting it
    /// otherwise. The empty string counts as already seen.
    pub fn seen(&self, canonical: &str) -> bool {
        if canonical.is_empty() {
            return true;
        }
        let idx = fnv1a32(canonical) as usize % self.shards.len();
        let mut shard = self.shards[idx].lock();
        if shard.contains(canonical) {
            return true;
        }
        shard.insert(canonical.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Deduper {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

fn fnv1a32(s: &str) -> u32 {
    const OFFSET: u32 = 2166136261;
    const PRIME: u32 = 16777619;
    let mut hash = OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
