#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_heap::{AllocError, AllocInitError, BuddyHeap, FreeError, Global};

/// A [`BuddyHeap`] under evaluation.
pub struct BuddyHeapSubject(BuddyHeap<Global>);

impl BuddyHeapSubject {
    pub fn new(size: usize) -> Result<Self, AllocInitError> {
        let h = BuddyHeap::try_new(size)?;
        Ok(BuddyHeapSubject(h))
    }

    pub fn heap(&self) -> &BuddyHeap<Global> {
        &self.0
    }
}

impl Subject for BuddyHeapSubject {
    type AllocError = AllocError;
    type FreeError = FreeError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::FreeError> {
        unsafe { self.0.deallocate(ptr) }
    }

    fn outstanding(&self) -> usize {
        self.0.pending()
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};
    use arbitrary::{Arbitrary, Unstructured};

    use super::*;

    const POOL: usize = 2 * 1024 * 1024;

    fn evaluate(size: usize, ops: Vec<AllocatorOp>) -> BuddyHeapSubject {
        let mut eval = Evaluator::new(BuddyHeapSubject::new(size).unwrap());
        eval.evaluate(ops).unwrap();
        eval.into_subject()
    }

    #[test]
    fn reference_sequence_leaves_nothing_pending() {
        use AllocatorOp::*;

        let ops = vec![
            Alloc(1_000_000),
            Alloc(250_000),
            Alloc(250_000),
            Alloc(250_000),
            Alloc(50_000),
            // Frees the second 250,000-byte block, the 50,000-byte block,
            // the third and then the first 250,000-byte block.
            Dealloc(2),
            Dealloc(2),
            Dealloc(2),
            Dealloc(1),
            Alloc(500_000),
        ];

        let subject = evaluate(POOL, ops);
        let heap = subject.heap();
        assert_eq!(heap.pending(), 0);
        assert_eq!(heap.largest_free_rank(), Some(heap.max_rank()));
    }

    #[test]
    fn remainder_region_survives_evaluation() {
        let size = POOL + 300_000;

        let ops = (0..64)
            .map(|i| match i % 3 {
                2 => AllocatorOp::Dealloc(i * 7),
                _ => AllocatorOp::Alloc(1 << (i % 19)),
            })
            .collect();

        let subject = evaluate(size, ops);
        let (offset, rank) = subject.heap().secondary_root().unwrap();
        assert_eq!(offset, POOL);
        assert!(subject.heap().free_offsets(rank).any(|ofs| ofs == offset));
    }

    #[test]
    fn arbitrary_ops_pass_evaluation() {
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut un = Unstructured::new(&data);
        let ops = Vec::<AllocatorOp>::arbitrary(&mut un).unwrap();

        let subject = evaluate(POOL, ops);
        assert_eq!(subject.heap().pending(), 0);
    }
}
