//! Per-rank free lists.
//!
//! Each rank has an intrusive singly linked list threaded through the headers
//! of its free blocks. Insertion prepends, so the most recently freed block of
//! a rank is the first one handed out again; callers must not rely on this.

use crate::{
    base::{BasePtr, BlockHeader},
    core::num::NonZeroUsize,
};

/// The number of rank slots. Ranks are bounded by the width of `usize`.
pub(crate) const NUM_RANKS: usize = usize::BITS as usize;

pub(crate) struct FreeLists {
    heads: [Option<NonZeroUsize>; NUM_RANKS],
    lens: [usize; NUM_RANKS],
}

impl FreeLists {
    pub const fn new() -> FreeLists {
        FreeLists {
            heads: [None; NUM_RANKS],
            lens: [0; NUM_RANKS],
        }
    }

    /// Empties every list without touching the blocks they contained.
    pub fn clear(&mut self) {
        self.heads = [None; NUM_RANKS];
        self.lens = [0; NUM_RANKS];
    }

    /// Returns the address of the first free block of rank `rank`.
    #[cfg(test)]
    #[inline]
    pub fn head(&self, rank: u32) -> Option<NonZeroUsize> {
        self.heads[rank as usize]
    }

    /// Returns the number of free blocks of rank `rank`.
    #[inline]
    pub fn len_at(&self, rank: u32) -> usize {
        self.lens[rank as usize]
    }

    /// Prepends the block at `block` to the list for its rank.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be the address of an initialized `BlockHeader` within
    ///   the provenance of `base`, with `free` set.
    /// - `block` must not currently be in any list.
    pub unsafe fn insert(&mut self, base: BasePtr, block: NonZeroUsize) {
        let header = unsafe { base.header_mut(block) };
        debug_assert!(header.free);

        let rank = header.rank as usize;
        header.next = self.heads[rank];

        self.heads[rank] = Some(block);
        self.lens[rank] += 1;
    }

    /// Unlinks the block at `block` from the list for its rank.
    ///
    /// Does nothing if the block is not in that list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be the address of an initialized `BlockHeader` within
    ///   the provenance of `base`.
    /// - Every block reachable from the lists must hold an initialized
    ///   `BlockHeader`.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        let (rank, next) = {
            let header = unsafe { base.header_mut(block) };
            (header.rank as usize, header.next)
        };

        let Some(head) = self.heads[rank] else {
            return;
        };

        if head == block {
            self.heads[rank] = next;
            self.lens[rank] -= 1;
            unsafe { base.header_mut(block) }.next = None;
            return;
        }

        let mut prev = head;
        loop {
            let prev_header = unsafe { base.header_mut(prev) };
            match prev_header.next {
                Some(n) if n == block => {
                    prev_header.next = next;
                    break;
                }
                Some(n) => prev = n,
                None => return,
            }
        }

        self.lens[rank] -= 1;
        unsafe { base.header_mut(block) }.next = None;
    }

    /// Removes and returns a free block from the lowest non-empty rank in
    /// `min_rank..=max_rank`, along with that rank.
    ///
    /// # Safety
    ///
    /// Every block reachable from the lists must hold an initialized
    /// `BlockHeader` within the provenance of `base`.
    pub unsafe fn pop_smallest_fit(
        &mut self,
        base: BasePtr,
        min_rank: u32,
        max_rank: u32,
    ) -> Option<(NonZeroUsize, u32)> {
        let rank = (min_rank..=max_rank).find(|&r| self.heads[r as usize].is_some())?;
        let block = self.heads[rank as usize]?;

        let header: &mut BlockHeader = unsafe { base.header_mut(block) };
        self.heads[rank as usize] = header.next.take();
        self.lens[rank as usize] -= 1;

        Some((block, rank))
    }

    /// Returns an iterator over the addresses of the free blocks of rank
    /// `rank`, in list order.
    ///
    /// # Safety
    ///
    /// Every block reachable from the list must hold an initialized
    /// `BlockHeader` within the provenance of `base`, and the lists must not
    /// be modified while the iterator is live.
    pub unsafe fn iter_rank(&self, base: BasePtr, rank: u32) -> RankIter {
        RankIter {
            base,
            cur: self.heads[rank as usize],
        }
    }
}

pub(crate) struct RankIter {
    base: BasePtr,
    cur: Option<NonZeroUsize>,
}

impl Iterator for RankIter {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let cur = self.cur?;
        // SAFETY: upheld by the caller of `FreeLists::iter_rank`.
        self.cur = unsafe { self.base.header_mut(cur) }.next;
        Some(cur)
    }
}
