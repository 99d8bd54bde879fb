//! Binary-buddy allocation over a single fixed region.
//!
//! A `BuddyHeap` manages one contiguous region of memory. Every block is
//! `2^rank` bytes long, begins with a block header, and starts at an offset
//! from the region base that is a multiple of its own size. Requests are
//! rounded up (header included) to the next power of two; larger free blocks
//! are split in half until a block of the right rank is obtained, and freed
//! blocks are merged with their buddies for as long as both halves are free.
//!
//! If the region size is not a power of two, the largest power-of-two prefix
//! forms the primary root block and the remainder, if it can hold a header,
//! forms a smaller secondary root block. The secondary root never merges with
//! anything; blocks split from it merge only among themselves.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                  |
//! |--------------------------|-----------|-----------------------------|
//! | Allocate                 | O(1)      | O(ranks)                    |
//! | Deallocate               | O(1)      | O(ranks × free list length) |
//!
//! #### Fragmentation
//!
//! Internal fragmentation is bounded by the power-of-two rounding: a request
//! occupies less than twice its size plus one header. External fragmentation
//! appears when free blocks of equal size are not buddies; an allocation can
//! fail even though the sum of free bytes exceeds the request.

use crate::{
    base::{buddy_offset, BasePtr, BlockHeader, HEADER_ALIGN, HEADER_SIZE},
    core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull},
    rank::{ceil_log2, floor_log2, rank_size},
    registry::{FreeLists, NUM_RANKS},
    AllocError, AllocInitError, BackingAllocator, FreeError, Raw,
};

// Shadowed by the inherent method on toolchains where strict provenance is
// stable.
#[cfg(feature = "sptr")]
#[allow(unused_imports)]
use crate::core::ptr::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

/// The root block carved from the part of the region past the largest
/// power-of-two prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SecondaryRoot {
    offset: usize,
    rank: u32,
}

/// A snapshot of a heap's bookkeeping, as returned by [`BuddyHeap::stats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The number of blocks currently allocated.
    pub pending: usize,
    /// The number of blocks in the free lists.
    pub free_blocks: usize,
    /// The total size of the free blocks, headers included.
    pub free_bytes: usize,
    /// The rank of the largest free block, if any block is free.
    pub largest_free_rank: Option<u32>,
}

/// A binary-buddy heap over a single fixed region.
///
/// For a discussion of the allocation strategy, see the [module-level
/// documentation].
///
/// [module-level documentation]: crate::buddy
pub struct BuddyHeap<A: BackingAllocator> {
    base: BasePtr,
    max_rank: u32,
    secondary: Option<SecondaryRoot>,
    free_lists: FreeLists,
    pending: usize,
    backing_allocator: A,
}

impl BuddyHeap<Raw> {
    /// Constructs a new `BuddyHeap` managing `size` bytes starting at `region`.
    ///
    /// The rank of the primary root block is `floor(log2(size))`. If the
    /// remaining `size - 2^rank` bytes exceed [`HEADER_SIZE`], they form a
    /// secondary root block; otherwise they are left unused.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if:
    /// - `region` is not aligned for block headers,
    /// - the region would not fit below the end of the address space, or
    /// - the primary root block would be smaller than [`HEADER_SIZE`].
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `size` bytes, and the
    ///   memory must be initialized.
    /// - The region must not be accessed except through the returned heap and
    ///   the allocations it hands out for as long as the heap exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        size: usize,
    ) -> Result<BuddyHeap<Raw>, AllocInitError> {
        unsafe { RawBuddyHeap::try_new(region, size).map(|h| h.with_backing_allocator(Raw)) }
    }

    /// Decomposes the heap into its region pointer and size.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// the returned region pointer becomes the sole owner of the region that
    /// was used to construct the heap.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.base.ptr(), self.base.extent())
    }
}

#[cfg(any(feature = "alloc", test))]
impl BuddyHeap<Global> {
    /// Attempts to construct a new `BuddyHeap` backed by the global allocator.
    ///
    /// The region of `size` bytes is allocated zeroed from the global allocator
    /// and returned to it when the heap is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `size` cannot host a root
    /// block, or [`AllocInitError::AllocFailed`] if the region could not be
    /// allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(size: usize) -> Result<BuddyHeap<Global>, AllocInitError> {
        let region_layout = Self::region_layout(size)?;

        unsafe {
            // SAFETY: region size is at least `HEADER_SIZE`, so it is not zero.
            let region_raw = alloc::alloc::alloc_zeroed(region_layout);
            let region_ptr =
                NonNull::new(region_raw).ok_or(AllocInitError::AllocFailed(region_layout))?;

            match RawBuddyHeap::try_new(region_ptr, size) {
                Ok(h) => Ok(h.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region_ptr.as_ptr(), region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> BuddyHeap<A> {
    /// Returns the layout of a region suitable for a heap of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if a heap of `size` bytes
    /// could not host its primary root block.
    pub fn region_layout(size: usize) -> Result<Layout, AllocInitError> {
        max_rank_for(size)?;

        Layout::from_size_align(size, HEADER_ALIGN).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the number of bytes in the managed region.
    #[inline]
    pub fn size(&self) -> usize {
        self.base.extent()
    }

    /// Returns the rank of the primary root block.
    ///
    /// No allocation can exceed `2^max_rank() - HEADER_SIZE` bytes.
    #[inline]
    pub fn max_rank(&self) -> u32 {
        self.max_rank
    }

    /// Returns the offset and rank of the secondary root block, if the region
    /// has one.
    #[inline]
    pub fn secondary_root(&self) -> Option<(usize, u32)> {
        self.secondary.map(|root| (root.offset, root.rank))
    }

    /// Returns the number of blocks currently allocated.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Returns the number of free blocks of rank `rank`.
    pub fn free_blocks(&self, rank: u32) -> usize {
        if rank as usize >= NUM_RANKS {
            return 0;
        }

        self.free_lists.len_at(rank)
    }

    /// Returns the offsets from the region base of the free blocks of rank
    /// `rank`.
    ///
    /// The order of the offsets is unspecified.
    pub fn free_offsets(&self, rank: u32) -> impl Iterator<Item = usize> + '_ {
        let base = self.base;
        let blocks = (rank as usize) < NUM_RANKS;

        // SAFETY: every block in the free lists holds a header written by this
        // heap, and the lists cannot change while `self` is borrowed.
        blocks
            .then(|| unsafe { self.free_lists.iter_rank(base, rank) })
            .into_iter()
            .flatten()
            .map(move |block| base.offset_to(block))
    }

    /// Returns the rank of the largest free block, if any block is free.
    pub fn largest_free_rank(&self) -> Option<u32> {
        (0..=self.max_rank)
            .rev()
            .find(|&rank| self.free_lists.len_at(rank) != 0)
    }

    /// Returns a snapshot of the heap's bookkeeping.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            pending: self.pending,
            largest_free_rank: self.largest_free_rank(),
            ..HeapStats::default()
        };

        for rank in 0..=self.max_rank {
            let count = self.free_lists.len_at(rank);
            stats.free_blocks += count;
            stats.free_bytes += count << rank;
        }

        stats
    }

    /// Attempts to allocate a block with room for `size` bytes.
    ///
    /// On success, returns a pointer to the payload of the block. The slice
    /// spans the whole payload, which is at least `size` bytes long. The
    /// contents of the block are unspecified.
    ///
    /// Among several free blocks of the smallest sufficient rank, the choice
    /// of block is unspecified.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block of sufficient size exists, even if the
    /// total amount of free memory would be enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let total = size.checked_add(HEADER_SIZE).ok_or(AllocError)?;
        let target_rank = ceil_log2(total);

        if target_rank > self.max_rank {
            return Err(AllocError);
        }

        let (block, mut rank) =
            unsafe { self.free_lists.pop_smallest_fit(self.base, target_rank, self.max_rank) }
                .ok_or(AllocError)?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        while rank > target_rank {
            rank -= 1;

            let back_half = block.checked_add(1 << rank).ok_or(AllocError)?;
            trace!(
                "buddy heap: split {:#x} into two blocks of rank {}",
                block.get(),
                rank
            );

            unsafe {
                self.base
                    .init_header_at(back_half, BlockHeader::free_at(back_half, rank));
                self.free_lists.insert(self.base, back_half);
            }
        }

        let mut header = BlockHeader::free_at(block, rank);
        header.free = false;
        unsafe { self.base.init_header_at(block, header) };

        self.pending += 1;

        let payload = block.checked_add(HEADER_SIZE).ok_or(AllocError)?;
        let len = (1 << rank) - HEADER_SIZE;

        // The returned block inherits the provenance of the base pointer.
        Ok(self.base.with_addr_and_size(payload, len))
    }

    /// Deallocates the block whose payload begins at `ptr`.
    ///
    /// The block is returned to the free lists and merged with its buddy for
    /// as long as the buddy is free and of the same rank.
    ///
    /// # Errors
    ///
    /// Returns [`FreeError::InvalidPointer`] without side effects if `ptr`
    /// does not lie inside the region or the header preceding it was not
    /// written by this heap. Returns [`FreeError::DoubleFree`] without side
    /// effects if the block is already free.
    ///
    /// Detection is best-effort: a pointer into memory that once held a
    /// header, such as a block freed and since merged into a larger
    /// allocation, may pass the checks.
    ///
    /// # Safety
    ///
    /// If `ptr - HEADER_SIZE` lies within the region, no reference to the
    /// `HEADER_SIZE` bytes at that address may be live. Pointers returned by
    /// [`allocate`](Self::allocate) and not yet deallocated always satisfy
    /// this.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let block = match self.validate(ptr) {
            Ok(block) => block,
            Err(e) => {
                warn!("buddy heap: rejected free of {:#x}: {}", ptr.addr().get(), e);
                return Err(e);
            }
        };

        unsafe {
            self.base.header_mut(block).free = true;
            self.free_lists.insert(self.base, block);
        }
        self.pending = self.pending.saturating_sub(1);

        unsafe { self.coalesce(block) };

        Ok(())
    }

    /// Discards all state and rebuilds the root blocks.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// none of them may be accessed or deallocated afterward.
    pub unsafe fn reset(&mut self) {
        unsafe { self.init_roots() };
    }

    /// Writes the root block headers and seeds the free lists with them.
    ///
    /// # Safety
    ///
    /// No block of the region may be allocated to a caller.
    unsafe fn init_roots(&mut self) {
        self.free_lists.clear();
        self.pending = 0;

        let primary = self.base.addr();
        unsafe {
            self.base
                .init_header_at(primary, BlockHeader::free_at(primary, self.max_rank));
            self.free_lists.insert(self.base, primary);
        }

        let primary_size = 1 << self.max_rank;
        let remainder = self.base.extent() - primary_size;

        self.secondary = None;
        if remainder > HEADER_SIZE {
            if let Some(addr) = self.base.addr_at(primary_size) {
                let rank = floor_log2(remainder);
                unsafe {
                    self.base.init_header_at(addr, BlockHeader::free_at(addr, rank));
                    self.free_lists.insert(self.base, addr);
                }

                self.secondary = Some(SecondaryRoot {
                    offset: primary_size,
                    rank,
                });
            }
        }

        debug!(
            "buddy heap: {:#x} bytes at {:#x}, max rank {}, secondary root {:?}",
            self.base.extent(),
            self.base.addr().get(),
            self.max_rank,
            self.secondary
        );
    }

    /// Checks that `ptr` is the payload of an allocated block of this heap,
    /// returning the block address.
    fn validate(&self, ptr: NonNull<u8>) -> Result<NonZeroUsize, FreeError> {
        let block = ptr
            .addr()
            .get()
            .checked_sub(HEADER_SIZE)
            .and_then(NonZeroUsize::new)
            .filter(|b| self.base.contains_addr(b.get()))
            .ok_or(FreeError::InvalidPointer)?;

        if block.get() % HEADER_ALIGN != 0 || block.get() + HEADER_SIZE > self.base.limit() {
            return Err(FreeError::InvalidPointer);
        }

        // SAFETY: the header lies within the region and is properly aligned.
        // The region is initialized memory, so any bit pattern read is an
        // integer value.
        let raw = unsafe { self.base.read_header(block) };

        if raw.self_addr != block.get() {
            return Err(FreeError::InvalidPointer);
        }

        let rank = u32::from(raw.rank);
        if rank > self.max_rank || raw.free > 1 {
            return Err(FreeError::InvalidPointer);
        }

        let block_ofs = self.base.offset_to(block);
        let block_size = rank_size(rank).ok_or(FreeError::InvalidPointer)?;
        if block_ofs % block_size != 0 || block_ofs + block_size > self.base.extent() {
            return Err(FreeError::InvalidPointer);
        }

        if raw.free == 1 {
            return Err(FreeError::DoubleFree);
        }

        Ok(block)
    }

    fn is_secondary_root(&self, block_ofs: usize, rank: u32) -> bool {
        self.secondary == Some(SecondaryRoot {
            offset: block_ofs,
            rank,
        })
    }

    /// Merges the free block at `block` with its buddy until no further merge
    /// is possible.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of this heap that is in the free lists.
    unsafe fn coalesce(&mut self, mut block: NonZeroUsize) {
        let mut rank = unsafe { self.base.header_mut(block) }.rank();

        while rank < self.max_rank {
            let block_ofs = self.base.offset_to(block);
            if self.is_secondary_root(block_ofs, rank) {
                break;
            }

            let buddy_ofs = buddy_offset(block_ofs, rank);
            let Some(buddy) = self.base.addr_at(buddy_ofs) else {
                break;
            };
            if buddy_ofs + (1 << rank) > self.base.extent() {
                break;
            }

            // SAFETY: `buddy` starts a block of this heap; a rank-`rank` block
            // and the region of its buddy are never covered by one larger
            // block.
            let buddy_header = unsafe { self.base.read_header(buddy) };
            if buddy_header.free != 1 || u32::from(buddy_header.rank) != rank {
                break;
            }

            unsafe {
                self.free_lists.remove(self.base, block);
                self.free_lists.remove(self.base, buddy);
            }

            block = block.min(buddy);
            rank += 1;

            trace!(
                "buddy heap: merged into {:#x} of rank {}",
                block.get(),
                rank
            );

            unsafe {
                self.base.init_header_at(block, BlockHeader::free_at(block, rank));
                self.free_lists.insert(self.base, block);
            }
        }
    }
}

impl<A: BackingAllocator> Drop for BuddyHeap<A> {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.base.extent(), HEADER_ALIGN) {
            unsafe { self.backing_allocator.deallocate(self.base.ptr(), layout) };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyHeap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("base", &self.base.ptr())
            .field("size", &self.base.extent())
            .field("max_rank", &self.max_rank)
            .field("secondary_root", &self.secondary_root())
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Returns the rank of the primary root block of a `size`-byte region.
fn max_rank_for(size: usize) -> Result<u32, AllocInitError> {
    if size < HEADER_SIZE {
        return Err(AllocInitError::InvalidConfig);
    }

    let max_rank = floor_log2(size);
    if (1 << max_rank) < HEADER_SIZE {
        return Err(AllocInitError::InvalidConfig);
    }

    Ok(max_rank)
}

/// Like a `BuddyHeap`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this struct
/// can be moved out of, while `BuddyHeap` itself cannot.
struct RawBuddyHeap {
    base: BasePtr,
    max_rank: u32,
}

impl RawBuddyHeap {
    /// Validates the region and computes the rank of its primary root.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes.
    unsafe fn try_new(region: NonNull<u8>, size: usize) -> Result<RawBuddyHeap, AllocInitError> {
        let max_rank = max_rank_for(size)?;

        if region.addr().get() % HEADER_ALIGN != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::new(region, size).ok_or(AllocInitError::InvalidConfig)?;

        Ok(RawBuddyHeap { base, max_rank })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> BuddyHeap<A> {
        let RawBuddyHeap { base, max_rank } = self;

        let mut heap = BuddyHeap {
            base,
            max_rank,
            secondary: None,
            free_lists: FreeLists::new(),
            pending: 0,
            backing_allocator,
        };

        // SAFETY: the heap was just created, so nothing is allocated.
        unsafe { heap.init_roots() };

        heap
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    use crate::base::RawHeader;

    const MIB: usize = 1 << 20;

    fn offset_of(heap: &BuddyHeap<Global>, ptr: NonNull<[u8]>) -> usize {
        ptr.cast::<u8>().addr().get() - heap.base.addr().get() - HEADER_SIZE
    }

    #[test]
    fn new_heap_has_one_root_for_power_of_two() {
        let heap = BuddyHeap::try_new(2 * MIB).unwrap();

        assert_eq!(heap.max_rank(), 21);
        assert_eq!(heap.secondary_root(), None);
        assert_eq!(heap.pending(), 0);
        assert_eq!(heap.free_offsets(21).collect::<Vec<_>>(), [0]);
        assert_eq!(heap.stats().free_bytes, 2 * MIB);
    }

    #[test]
    fn remainder_forms_secondary_root() {
        let heap = BuddyHeap::try_new(2 * MIB + 256 * 1024).unwrap();

        assert_eq!(heap.max_rank(), 21);
        assert_eq!(heap.secondary_root(), Some((2 * MIB, 18)));
        assert_eq!(heap.free_offsets(18).collect::<Vec<_>>(), [2 * MIB]);
        assert_eq!(heap.largest_free_rank(), Some(21));
    }

    #[test]
    fn remainder_too_small_for_header_is_wasted() {
        let heap = BuddyHeap::try_new(4096 + HEADER_SIZE).unwrap();
        assert_eq!(heap.secondary_root(), None);
        assert_eq!(heap.stats().free_blocks, 1);

        let heap = BuddyHeap::try_new(4096 + HEADER_SIZE + 1).unwrap();
        assert!(heap.secondary_root().is_some());
        assert_eq!(heap.stats().free_blocks, 2);
    }

    #[test]
    fn too_small_region_is_rejected() {
        assert!(matches!(
            BuddyHeap::try_new(0),
            Err(AllocInitError::InvalidConfig)
        ));
        assert!(matches!(
            BuddyHeap::try_new(HEADER_SIZE - 1),
            Err(AllocInitError::InvalidConfig)
        ));
    }

    #[test]
    fn misaligned_raw_region_is_rejected() {
        let mut buf = [0u64; 64];
        let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let misaligned = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(1)) };

        let res = unsafe { BuddyHeap::new_raw(misaligned, 256) };
        assert!(matches!(res, Err(AllocInitError::InvalidConfig)));
    }

    #[test]
    fn raw_heap_returns_its_region() {
        let mut buf = [0u64; 64];
        let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

        let mut heap = unsafe { BuddyHeap::new_raw(ptr, 512) }.unwrap();
        assert_eq!(heap.max_rank(), 9);

        let a = heap.allocate(100).unwrap();
        assert!(a.len() >= 100);
        unsafe { heap.deallocate(a.cast()) }.unwrap();

        let (region, size) = unsafe { heap.into_raw_parts() };
        assert_eq!(region, ptr);
        assert_eq!(size, 512);
    }

    #[test]
    fn allocation_splits_down_to_target_rank() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();

        // 100 + header rounds up to a rank-7 block.
        let a = heap.allocate(100).unwrap();
        assert_eq!(a.len(), 128 - HEADER_SIZE);
        assert_eq!(offset_of(&heap, a), 0);

        // Splitting left one free block at each rank from 7 to 11.
        for rank in 7..12 {
            assert_eq!(
                heap.free_offsets(rank).collect::<Vec<_>>(),
                [1 << rank],
                "rank {rank}"
            );
        }
        assert_eq!(heap.free_blocks(12), 0);
        assert_eq!(heap.pending(), 1);
    }

    #[test]
    fn smallest_sufficient_block_is_used() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(1000).unwrap();

        // The rank-10 block left over from the first split serves the second
        // request without touching the rank-11 block.
        assert_eq!(offset_of(&heap, b), 1024);
        assert_eq!(heap.free_blocks(11), 1);

        unsafe {
            heap.deallocate(a.cast()).unwrap();
            heap.deallocate(b.cast()).unwrap();
        }
    }

    #[test]
    fn zero_sized_request_takes_smallest_block() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();

        let a = heap.allocate(0).unwrap();
        assert_eq!(a.len(), (1 << ceil_log2(HEADER_SIZE)) - HEADER_SIZE);
        unsafe { heap.deallocate(a.cast()) }.unwrap();

        assert_eq!(heap.free_offsets(12).collect::<Vec<_>>(), [0]);
    }

    #[test]
    fn oversized_requests_are_exhausted() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();

        assert_eq!(heap.allocate(4096 - HEADER_SIZE + 1), Err(AllocError));
        assert_eq!(heap.allocate(usize::MAX), Err(AllocError));
        assert_eq!(heap.allocate(usize::MAX - HEADER_SIZE), Err(AllocError));
        assert_eq!(heap.pending(), 0);

        let whole = heap.allocate(4096 - HEADER_SIZE).unwrap();
        assert_eq!(heap.allocate(0), Err(AllocError));
        unsafe { heap.deallocate(whole.cast()) }.unwrap();
    }

    #[test]
    fn buddies_merge_regardless_of_free_order() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();

        let blocks: Vec<_> = (0..4).map(|_| heap.allocate(1000).unwrap()).collect();
        assert_eq!(heap.allocate(0), Err(AllocError));

        for i in [2, 0, 3, 1] {
            unsafe { heap.deallocate(blocks[i].cast()) }.unwrap();
        }

        assert_eq!(heap.pending(), 0);
        assert_eq!(heap.free_offsets(12).collect::<Vec<_>>(), [0]);
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn non_buddies_do_not_merge() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();

        let blocks: Vec<_> = (0..4).map(|_| heap.allocate(1000).unwrap()).collect();

        // Blocks 1 and 2 are adjacent and equally sized, but not buddies.
        unsafe {
            heap.deallocate(blocks[1].cast()).unwrap();
            heap.deallocate(blocks[2].cast()).unwrap();
        }

        assert_eq!(heap.free_blocks(10), 2);
        assert_eq!(heap.free_blocks(11), 0);
        assert_eq!(heap.allocate(2000), Err(AllocError));
    }

    #[test]
    fn secondary_root_children_merge_back() {
        // Primary rank 12, secondary rank 10.
        let mut heap = BuddyHeap::try_new(4096 + 1024).unwrap();

        let primary = heap.allocate(4000).unwrap();
        let a = heap.allocate(400).unwrap();
        let b = heap.allocate(400).unwrap();
        assert_eq!(offset_of(&heap, a), 4096);
        assert_eq!(offset_of(&heap, b), 4096 + 512);

        // Free the lower half last so the merge starts from the block that
        // shares the secondary root's address.
        unsafe {
            heap.deallocate(b.cast()).unwrap();
            heap.deallocate(a.cast()).unwrap();
        }

        assert_eq!(heap.free_offsets(10).collect::<Vec<_>>(), [4096]);
        assert_eq!(heap.free_blocks(9), 0);

        // The secondary root does not merge with the primary.
        unsafe { heap.deallocate(primary.cast()) }.unwrap();
        assert_eq!(heap.free_offsets(12).collect::<Vec<_>>(), [0]);
        assert_eq!(heap.free_offsets(10).collect::<Vec<_>>(), [4096]);
    }

    #[test]
    fn invalid_pointers_are_rejected_without_side_effects() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();
        let a = heap.allocate(1000).unwrap();
        let before = heap.stats();

        unsafe { a.cast::<u8>().as_ptr().write_bytes(0, a.len()) };
        let ptr = a.cast::<u8>();

        for ofs in [1, HEADER_SIZE, 64, 504] {
            let inner = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(ofs)) };
            assert_eq!(
                unsafe { heap.deallocate(inner) },
                Err(FreeError::InvalidPointer)
            );
        }

        // Before the region.
        let outside = NonNull::new(HEADER_SIZE as *mut u8).unwrap();
        assert_eq!(
            unsafe { heap.deallocate(outside) },
            Err(FreeError::InvalidPointer)
        );

        assert_eq!(heap.stats(), before);
        unsafe { heap.deallocate(ptr) }.unwrap();
    }

    /// Writes a header at `block` that claims its own address, returning the
    /// payload pointer that would belong to it.
    fn forge_header(block: NonNull<u8>, rank: u8) -> NonNull<u8> {
        let raw = RawHeader {
            self_addr: block.as_ptr() as usize,
            next: 0,
            rank,
            free: 0,
        };

        unsafe {
            block.cast::<RawHeader>().as_ptr().write(raw);
            NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE))
        }
    }

    #[test]
    fn self_addressed_headers_with_bad_geometry_are_rejected() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();
        let a = heap.allocate(1000).unwrap();
        let before = heap.stats();

        // Offset 64 from the region base.
        let fake = unsafe { NonNull::new_unchecked(a.cast::<u8>().as_ptr().add(40)) };
        assert_eq!(offset_of(&heap, a) + HEADER_SIZE + 40, 64);

        // Rank above the primary root.
        let ptr = forge_header(fake, 13);
        assert_eq!(
            unsafe { heap.deallocate(ptr) },
            Err(FreeError::InvalidPointer)
        );

        // Offset 64 is not a multiple of 2^7.
        let ptr = forge_header(fake, 7);
        assert_eq!(
            unsafe { heap.deallocate(ptr) },
            Err(FreeError::InvalidPointer)
        );

        assert_eq!(heap.stats(), before);
        unsafe { heap.deallocate(a.cast()) }.unwrap();
        assert_eq!(heap.free_offsets(12).collect::<Vec<_>>(), [0]);
    }

    #[test]
    fn header_extending_past_region_is_rejected() {
        // Primary rank 12, secondary rank 10 at offset 4096.
        let mut heap = BuddyHeap::try_new(4096 + 1024).unwrap();

        let primary = heap.allocate(4000).unwrap();
        let small = heap.allocate(1000).unwrap();
        assert_eq!(offset_of(&heap, small), 4096);
        let before = heap.stats();

        // A rank-11 block at offset 4096 is aligned, but would end at 6144.
        let block =
            unsafe { NonNull::new_unchecked(small.cast::<u8>().as_ptr().sub(HEADER_SIZE)) };
        let ptr = forge_header(block, 11);
        assert_eq!(ptr, small.cast());
        assert_eq!(
            unsafe { heap.deallocate(ptr) },
            Err(FreeError::InvalidPointer)
        );
        assert_eq!(heap.stats(), before);

        forge_header(block, 10);
        unsafe {
            heap.deallocate(small.cast()).unwrap();
            heap.deallocate(primary.cast()).unwrap();
        }
        assert_eq!(heap.stats().free_blocks, 2);
    }

    #[test]
    fn double_free_is_detected() {
        let mut heap = BuddyHeap::try_new(4096).unwrap();
        let a = heap.allocate(1000).unwrap();
        let b = heap.allocate(1000).unwrap();

        unsafe {
            heap.deallocate(b.cast()).unwrap();
            assert_eq!(heap.deallocate(b.cast()), Err(FreeError::DoubleFree));
        }

        let before = heap.stats();
        assert_eq!(before.pending, 1);

        // `a` merges into the root; its header now describes the free root.
        unsafe {
            heap.deallocate(a.cast()).unwrap();
            assert_eq!(heap.deallocate(a.cast()), Err(FreeError::DoubleFree));
        }
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn reset_discards_outstanding_allocations() {
        let mut heap = BuddyHeap::try_new(2 * MIB + 256 * 1024).unwrap();

        for _ in 0..5 {
            heap.allocate(1000).unwrap();
        }
        assert_eq!(heap.pending(), 5);

        unsafe { heap.reset() };

        assert_eq!(heap.pending(), 0);
        assert_eq!(heap.free_offsets(21).collect::<Vec<_>>(), [0]);
        assert_eq!(heap.free_offsets(18).collect::<Vec<_>>(), [2 * MIB]);
        assert_eq!(heap.stats().free_blocks, 2);
    }

    #[test]
    fn free_offsets_out_of_range_rank_is_empty() {
        let heap = BuddyHeap::try_new(4096).unwrap();
        assert_eq!(heap.free_offsets(usize::BITS).count(), 0);
        assert_eq!(heap.free_blocks(usize::BITS + 3), 0);
    }
}
