//! Dense integer ID allocation with reuse.
//!
//! IDs are handed out smallest-first. Freed IDs land in a bitset that the
//! next allocation scans before growing the high-water mark; freeing the
//! highest live ID shrinks the mark instead, walking down over any freed IDs
//! sitting directly below it. Uniqueness of live IDs is the only guarantee;
//! freeing an ID that is not live is a caller bug.

use parking_lot::Mutex;

const WORD_BITS: u32 = u64::BITS;

#[derive(Default)]
struct Inner {
    /// Bitset of freed IDs strictly below `high_water`.
    freed: Vec<u64>,
    freed_count: usize,
    high_water: u32,
}

impl Inner {
    fn bit(&self, id: u32) -> bool {
        let word = (id / WORD_BITS) as usize;
        self.freed
            .get(word)
            .is_some_and(|w| w & (1 << (id % WORD_BITS)) != 0)
    }

    fn set_bit(&mut self, id: u32) {
        let word = (id / WORD_BITS) as usize;
        if word >= self.freed.len() {
            self.freed.resize(word + 1, 0);
        }
        self.freed[word] |= 1 << (id % WORD_BITS);
    }

    fn clear_bit(&mut self, id: u32) {
        let word = (id / WORD_BITS) as usize;
        self.freed[word] &= !(1 << (id % WORD_BITS));
    }
}

/// Allocator handing out the smallest currently-unused non-negative integer.
pub struct IdAssigner {
    inner: Mutex<Inner>,
}

impl IdAssigner {
    /// Creates an assigner with no live IDs.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the smallest ID that is not currently live.
    pub fn allocate(&self) -> u32 {
        let mut inner = self.inner.lock();
        if inner.freed_count > 0 {
            let reusable = inner
                .freed
                .iter()
                .enumerate()
                .find(|(_, word)| **word != 0)
                .map(|(word_idx, word)| word_idx as u32 * WORD_BITS + word.trailing_zeros());
            let id = reusable.expect("freed_count positive but bitset empty");
            inner.clear_bit(id);
            inner.freed_count -= 1;
            return id;
        }
        let id = inner.high_water;
        inner.high_water += 1;
        id
    }

    /// Returns `id` to the pool. Freeing the highest live ID shrinks the
    /// allocation range, consuming any freed IDs directly below it.
    pub fn free(&self, id: u32) {
        let mut inner = self.inner.lock();
        debug_assert!(id < inner.high_water, "freed ID {id} was never allocated");
        debug_assert!(!inner.bit(id), "double free of ID {id}");
        if id + 1 == inner.high_water {
            inner.high_water = id;
            while inner.high_water > 0 && inner.bit(inner.high_water - 1) {
                let top = inner.high_water - 1;
                inner.clear_bit(top);
                inner.freed_count -= 1;
                inner.high_water = top;
            }
        } else {
            inner.set_bit(id);
            inner.freed_count += 1;
        }
    }

    /// Number of currently-live IDs.
    pub fn live(&self) -> usize {
        let inner = self.inner.lock();
        inner.high_water as usize - inner.freed_count
    }
}

impl Default for IdAssigner {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped acquisition of an ID: allocated on construction, freed on drop.
pub struct ScopedId<'a> {
    assigner: &'a IdAssigner,
    id: u32,
}

impl<'a> ScopedId<'a> {
    /// Allocates an ID that lives for the scope of the returned guard.
    pub fn new(assigner: &'a IdAssigner) -> Self {
        let id = assigner.allocate();
        Self { assigner, id }
    }

    /// The held ID; stable for the lifetime of the guard.
    pub fn value(&self) -> u32 {
        self.id
    }
}

impl Drop for ScopedId<'_> {
    fn drop(&mut self) {
        self.assigner.free(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn allocates_densely_from_zero() {
        let assigner = IdAssigner::new();
        assert_eq!(assigner.allocate(), 0);
        assert_eq!(assigner.allocate(), 1);
        assert_eq!(assigner.allocate(), 2);
        assert_eq!(assigner.live(), 3);
    }

    #[test]
    fn freed_id_is_reused_before_growth() {
        let assigner = IdAssigner::new();
        let _id0 = assigner.allocate();
        let id1 = assigner.allocate();
        let _id2 = assigner.allocate();

        assigner.free(id1);
        assert_eq!(assigner.allocate(), 1);
        assert_eq!(assigner.allocate(), 3);
    }

    #[test]
    fn freeing_top_id_shrinks_range() {
        let assigner = IdAssigner::new();
        assigner.allocate();
        assigner.allocate();
        let top = assigner.allocate();
        assert_eq!(top, 2);

        assigner.free(top);
        assert_eq!(assigner.allocate(), 2);
    }

    #[test]
    fn shrink_walks_over_freed_run() {
        let assigner = IdAssigner::new();
        let ids: Vec<u32> = (0..5).map(|_| assigner.allocate()).collect();
        assigner.free(ids[3]);
        assigner.free(ids[2]);
        // Freeing 4 should collapse over the freed 3 and 2 as well.
        assigner.free(ids[4]);
        assert_eq!(assigner.live(), 2);
        assert_eq!(assigner.allocate(), 2);
    }

    #[test]
    fn freed_ids_all_return() {
        let assigner = IdAssigner::new();
        let ids: Vec<u32> = (0..10).map(|_| assigner.allocate()).collect();
        for id in ids.iter().step_by(2) {
            assigner.free(*id);
        }
        let reused: BTreeSet<u32> = (0..5).map(|_| assigner.allocate()).collect();
        assert_eq!(reused, BTreeSet::from([0, 2, 4, 6, 8]));
    }

    #[test]
    fn scoped_id_frees_on_drop() {
        let assigner = IdAssigner::new();
        {
            let sid = ScopedId::new(&assigner);
            assert_eq!(sid.value(), 0);
            assert_eq!(assigner.allocate(), 1);
        }
        // 0 was released by the guard; 1 is still live.
        assert_eq!(assigner.allocate(), 0);
    }

    #[test]
    fn scoped_id_frees_on_panic() {
        let assigner = IdAssigner::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _sid = ScopedId::new(&assigner);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(assigner.live(), 0);
    }
}
