//! Fixed-capacity slot accounting.
//!
//! A used/free bitmap plus one reference count per slot. `alloc`, `reference`,
//! `dereference` and `free` are the only mutators; a slot is returned to the
//! free set when its count drops to zero. All operations are lock-free and
//! safe to call from any core.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const WORD_BITS: usize = 64;

pub struct ResourceTable {
    used: Box<[AtomicU64]>,
    refs: Box<[AtomicU32]>,
    capacity: usize,
    in_use: AtomicUsize,
    /// Word to start the next search from.
    hint: AtomicUsize,
}

impl ResourceTable {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(WORD_BITS);
        Self {
            used: (0..words).map(|_| AtomicU64::new(0)).collect(),
            refs: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            capacity,
            in_use: AtomicUsize::new(0),
            hint: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn is_used(&self, index: usize) -> bool {
        index < self.capacity
            && self.used[index / WORD_BITS].load(Ordering::Acquire) & bit(index) != 0
    }

    #[cfg(test)]
    pub fn ref_count(&self, index: usize) -> u32 {
        self.refs.get(index).map_or(0, |r| r.load(Ordering::Acquire))
    }

    /// Claim a free slot with a reference count of one.
    pub fn alloc(&self) -> Option<usize> {
        let words = self.used.len();
        if words == 0 {
            return None;
        }
        let start = self.hint.load(Ordering::Relaxed) % words;

        for step in 0..words {
            let w = (start + step) % words;
            let word = &self.used[w];
            let mut current = word.load(Ordering::Relaxed);
            loop {
                let free = !current & self.word_mask(w);
                if free == 0 {
                    break;
                }
                let b = free.trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    current,
                    current | (1 << b),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let index = w * WORD_BITS + b;
                        self.refs[index].store(1, Ordering::Release);
                        self.in_use.fetch_add(1, Ordering::Relaxed);
                        self.hint.store(w, Ordering::Relaxed);
                        return Some(index);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Add a reference to a used slot. Returns the new count.
    #[cfg(test)]
    pub fn reference(&self, index: usize) -> Option<u32> {
        if !self.is_used(index) {
            return None;
        }
        Some(self.refs[index].fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Drop a reference; the slot is freed when the count reaches zero.
    /// Returns the remaining count.
    pub fn dereference(&self, index: usize) -> Option<u32> {
        if !self.is_used(index) {
            return None;
        }
        let prev = self.refs[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        if prev == 1 {
            self.free(index);
        }
        Some(prev - 1)
    }

    /// Return a slot to the free set regardless of its count.
    pub fn free(&self, index: usize) {
        if index >= self.capacity {
            return;
        }
        self.refs[index].store(0, Ordering::Release);
        let prev = self.used[index / WORD_BITS].fetch_and(!bit(index), Ordering::AcqRel);
        if prev & bit(index) != 0 {
            self.in_use.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn word_mask(&self, word: usize) -> u64 {
        let bits = (self.capacity - word * WORD_BITS).min(WORD_BITS);
        if bits == WORD_BITS {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }
}

fn bit(index: usize) -> u64 {
    1 << (index % WORD_BITS)
}
