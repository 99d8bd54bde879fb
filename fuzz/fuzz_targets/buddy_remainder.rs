#![no_main]
use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use buddy_heap_hater::BuddyHeapSubject;
use libfuzzer_sys::fuzz_target;

const MAX_SIZE: usize = 1 << 24;

#[derive(Clone, Debug)]
struct Args {
    size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let size = usize::arbitrary(un)? % MAX_SIZE;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { size, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { size, ops } = args;

    let heap = match BuddyHeapSubject::new(size) {
        Ok(h) => h,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(heap);
    if let Err(failed) = eval.evaluate(ops) {
        panic!("\nevaluation failed.\nheap size: {size}\n{failed:?}");
    }

    let heap = eval.into_subject();
    let stats = heap.heap().stats();
    assert_eq!(stats.pending, 0);
    if let Some((offset, rank)) = heap.heap().secondary_root() {
        assert!(heap.heap().free_offsets(rank).any(|ofs| ofs == offset));
    }
});
