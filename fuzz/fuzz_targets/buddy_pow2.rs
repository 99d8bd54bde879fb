#![no_main]
use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use buddy_heap_hater::BuddyHeapSubject;
use libfuzzer_sys::fuzz_target;

const MIN_RANK: u32 = 6;
const MAX_RANK: u32 = 24;

#[derive(Clone, Debug)]
struct Args {
    size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let rank = MIN_RANK + u32::arbitrary(un)? % (MAX_RANK - MIN_RANK + 1);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            size: 1 << rank,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args { size, ops } = args;

    let heap = match BuddyHeapSubject::new(size) {
        Ok(h) => h,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(heap);
    eval.evaluate(ops).unwrap();

    let heap = eval.into_subject();
    assert_eq!(heap.heap().free_offsets(heap.heap().max_rank()).count(), 1);
});
