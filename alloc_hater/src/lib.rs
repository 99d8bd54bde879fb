//! A small library for ~~hating on~~ evaluating the correctness of
//! size-driven heap allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{fmt, mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on request size, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 22;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread across orders of magnitude rather than uniformly, so that
/// both tiny and region-sized requests show up in practice.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let bits = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << bits);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Request a block with room for the given number of bytes.
    Alloc(usize),
    /// Free an outstanding block.
    ///
    /// Given `n` outstanding blocks, the block to free is at index `idx % n`.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;
    type FreeError: fmt::Debug;

    /// Allocates a block with room for at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a previous call to `allocate` on this
    /// subject.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::FreeError>;

    /// Returns the number of blocks the subject believes are outstanding.
    fn outstanding(&self) -> usize;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the payload handed out by the subject.
    ptr: NonNull<[u8]>,
    // The number of bytes originally requested.
    requested: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, requested: usize, id: u64) -> Block {
        let mut b = Block { ptr, requested, id };
        b.paint(id);
        b
    }

    /// Returns the number of bytes originally requested for this block.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, usize) {
        (self.ptr, self.requested)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;

        let id_bytes = id.to_le_bytes().into_iter().cycle();
        for (byte, value) in self.as_uninit_slice_mut().iter_mut().zip(id_bytes) {
            byte.write(value);
        }
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: every byte was initialized by `paint`.
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice
            .iter()
            .zip(id_bytes)
            .all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

/// Why an evaluation stopped.
#[derive(Clone, Debug)]
pub enum Failure {
    /// A block returned by `allocate` was smaller than requested.
    ShortBlock { requested: usize, len: usize },
    /// A live block's contents were overwritten.
    Corrupted,
    /// The subject rejected a pointer it had handed out.
    FreeRejected(String),
    /// The subject's outstanding count disagreed with the evaluator's.
    Outstanding { expected: usize, actual: usize },
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
    pub failure: Failure,
}

impl Failed {
    fn at(completed: Vec<AllocatorOp>, op: AllocatorOp, failure: Failure) -> Failed {
        Failed {
            completed,
            failed_op: Some(op),
            failure,
        }
    }
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();

            match op {
                AllocatorOp::Alloc(size) => {
                    let ptr = match self.subject.allocate(size) {
                        Ok(p) => p,
                        Err(_) => {
                            completed.push(op);
                            continue;
                        }
                    };

                    if ptr.len() < size {
                        return Err(Failed::at(
                            completed,
                            op,
                            Failure::ShortBlock {
                                requested: size,
                                len: ptr.len(),
                            },
                        ));
                    }

                    let block = unsafe { Block::init(ptr, size, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => {
                            completed.push(op);
                            continue;
                        }
                    };

                    if !block.verify() {
                        return Err(Failed::at(completed, op, Failure::Corrupted));
                    }

                    block.paint(op_id);
                    let (ptr, _) = block.into_raw_parts();
                    if let Err(e) = unsafe { self.subject.deallocate(ptr.cast()) } {
                        let failure = Failure::FreeRejected(format!("{e:?}"));
                        return Err(Failed::at(completed, op, failure));
                    }
                }
            }

            if self.subject.outstanding() != blocks.len() {
                let failure = Failure::Outstanding {
                    expected: blocks.len(),
                    actual: self.subject.outstanding(),
                };
                return Err(Failed::at(completed, op, failure));
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                    failure: Failure::Corrupted,
                });
            }

            let (ptr, _) = block.into_raw_parts();
            if let Err(e) = unsafe { self.subject.deallocate(ptr.cast()) } {
                return Err(Failed {
                    completed,
                    failed_op: None,
                    failure: Failure::FreeRejected(format!("{e:?}")),
                });
            }
        }

        match self.subject.outstanding() {
            0 => Ok(()),
            actual => Err(Failed {
                completed,
                failed_op: None,
                failure: Failure::Outstanding {
                    expected: 0,
                    actual,
                },
            }),
        }
    }
}
