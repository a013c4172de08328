// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory pool of freed file regions.
//!
//! Allocation pops the largest block that satisfies a request; adjacent
//! blocks coalesce on insertion. The pool is bounded; blocks pushed out of
//! a full pool are counted as fragmentation and reclaimed only by
//! defragmentation or a region rescan.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct FreeBlockPool {
    by_off: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
    capacity: usize,
    frag_count: u64,
}

impl FreeBlockPool {
    pub fn new(capacity: usize) -> Self {
        FreeBlockPool {
            by_off: BTreeMap::new(),
            by_size: BTreeSet::new(),
            capacity: capacity.max(1),
            frag_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_off.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_off.is_empty()
    }

    pub fn frag_count(&self) -> u64 {
        self.frag_count
    }

    pub fn add_frag(&mut self, num: u64) {
        self.frag_count += num;
    }

    pub fn clear(&mut self) {
        self.by_off.clear();
        self.by_size.clear();
        self.frag_count = 0;
    }

    /// Insert a freed region, coalescing with adjacent pool entries.
    pub fn insert(&mut self, mut off: u64, mut size: u64) {
        if size == 0 {
            return;
        }
        if let Some((&poff, &psiz)) = self.by_off.range(..off).next_back() {
            if poff + psiz == off {
                self.by_off.remove(&poff);
                self.by_size.remove(&(psiz, poff));
                off = poff;
                size += psiz;
            }
        }
        if let Some((&noff, &nsiz)) = self.by_off.range(off + size..).next() {
            if off + size == noff {
                self.by_off.remove(&noff);
                self.by_size.remove(&(nsiz, noff));
                size += nsiz;
            }
        }
        self.by_off.insert(off, size);
        self.by_size.insert((size, off));
        if self.by_off.len() > self.capacity {
            // Drop the smallest block; its space stays on disk as
            // fragmentation until a defrag pass reclaims it.
            if let Some(&(ssiz, soff)) = self.by_size.iter().next() {
                self.by_size.remove(&(ssiz, soff));
                self.by_off.remove(&soff);
                self.frag_count += 1;
            }
        }
    }

    /// Pop the largest block of at least `size` bytes.
    pub fn fetch(&mut self, size: u64) -> Option<(u64, u64)> {
        let &(bsiz, boff) = self.by_size.iter().next_back()?;
        if bsiz < size {
            return None;
        }
        self.by_size.remove(&(bsiz, boff));
        self.by_off.remove(&boff);
        Some((boff, bsiz))
    }

    /// Remove the block starting exactly at `off`, if pooled.
    pub fn remove_at(&mut self, off: u64) -> Option<u64> {
        let size = self.by_off.remove(&off)?;
        self.by_size.remove(&(size, off));
        Some(size)
    }

    /// Offset of the first pooled block, if any.
    pub fn first_off(&self) -> Option<u64> {
        self.by_off.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_block_wins() {
        let mut pool = FreeBlockPool::new(16);
        pool.insert(100, 32);
        pool.insert(300, 64);
        pool.insert(500, 16);
        assert_eq!(pool.fetch(24), Some((300, 64)));
        assert_eq!(pool.fetch(24), Some((100, 32)));
        assert_eq!(pool.fetch(24), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn adjacent_blocks_coalesce() {
        let mut pool = FreeBlockPool::new(16);
        pool.insert(100, 32);
        pool.insert(164, 16);
        pool.insert(132, 32); // bridges both neighbors
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.fetch(1), Some((100, 80)));
    }

    #[test]
    fn overflow_counts_fragmentation() {
        let mut pool = FreeBlockPool::new(2);
        pool.insert(100, 8);
        pool.insert(200, 16);
        pool.insert(300, 32);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.frag_count(), 1);
        // The smallest block was the casualty.
        assert_eq!(pool.remove_at(100), None);
        assert_eq!(pool.remove_at(300), Some(32));
    }
}
