use crate::core::{
    mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

// Shadowed by the inherent methods on toolchains where strict provenance is
// stable.
#[cfg(feature = "sptr")]
#[allow(unused_imports)]
use crate::core::ptr::{NonNullStrict, Strict};

/// The number of bytes every block reserves for its [`BlockHeader`].
///
/// The payload address handed to callers is always the block address plus
/// `HEADER_SIZE`.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// The alignment required of every block address.
pub(crate) const HEADER_ALIGN: usize = mem::align_of::<BlockHeader>();

/// Metadata embedded at the start of every block.
///
/// The header of a free block also serves as its free-list link, forming an
/// intrusive singly linked list per rank.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    /// The address of this header. A header whose `self_addr` differs from
    /// its location was never written by the heap.
    pub self_addr: usize,
    // Rather than using a pointer, store only the address of the next free
    // block. This avoids implying a borrow of the next block; any actual
    // pointer to a block must be acquired via the heap base pointer, and NOT
    // by casting this address directly!
    pub next: Option<NonZeroUsize>,
    pub rank: u8,
    pub free: bool,
}

impl BlockHeader {
    /// Returns a header for a free, unlinked block of rank `rank` at `addr`.
    #[inline]
    pub fn free_at(addr: NonZeroUsize, rank: u32) -> BlockHeader {
        debug_assert!(rank < usize::BITS);

        BlockHeader {
            self_addr: addr.get(),
            next: None,
            rank: rank as u8,
            free: true,
        }
    }

    #[inline]
    pub fn rank(&self) -> u32 {
        u32::from(self.rank)
    }
}

/// Returns the offset of the buddy of the rank-`rank` block at `block_ofs`.
///
/// Because a rank-`r` block always starts at a multiple of `2^r` from the
/// base, a block and its buddy differ only in bit `r` of their offsets.
#[inline]
pub(crate) fn buddy_offset(block_ofs: usize, rank: u32) -> usize {
    debug_assert_eq!(block_ofs & ((1 << rank) - 1), 0);

    block_ofs ^ (1 << rank)
}

/// A pointer to the base of the region of memory managed by a heap.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, managing `extent` bytes.
    ///
    /// Returns `None` if the end of the region overflows `usize`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns the number of bytes in the region.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn limit(self) -> usize {
        self.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: usize) -> bool {
        self.addr().get() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        debug_assert!(self.contains_addr(block.get()));

        block.get() - self.addr().get()
    }

    /// Returns the address `offset` bytes past the base, if it lies inside
    /// the region.
    #[inline]
    pub fn addr_at(self, offset: usize) -> Option<NonZeroUsize> {
        if offset >= self.extent {
            return None;
        }

        // Cannot overflow: `BasePtr::new` checked the region limit.
        NonZeroUsize::new(self.addr().get() + offset)
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr.get()));

        self.ptr.with_addr(addr)
    }

    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr.get()));
        debug_assert!(addr.get() + len <= self.limit());

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        // SAFETY: `addr` is non-zero.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Writes `header` to the block at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockHeader` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockHeader>()` bytes.
    /// - The memory at `addr` must not be allocated to a caller.
    #[inline]
    pub unsafe fn init_header_at(self, addr: NonZeroUsize, header: BlockHeader) {
        debug_assert!(self.contains_addr(addr.get()));
        debug_assert_eq!(addr.get() % HEADER_ALIGN, 0);
        debug_assert!(
            header.next.map_or(true, |next| self.contains_addr(next.get())),
            "next link out of region"
        );

        unsafe {
            self.with_addr(addr)
                .cast::<BlockHeader>()
                .as_ptr()
                .write(header)
        };
    }

    /// Returns a mutable reference to the `BlockHeader` at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockHeader` values.
    /// - The memory at `addr` must be within the provenance of `self` and
    ///   valid for reads and writes for `size_of::<BlockHeader>()` bytes.
    /// - No other reference to the header at `addr` may be live.
    #[inline]
    pub unsafe fn header_mut<'a>(self, addr: NonZeroUsize) -> &'a mut BlockHeader {
        debug_assert!(self.contains_addr(addr.get()));

        unsafe { self.with_addr(addr).cast::<BlockHeader>().as_mut() }
    }

    /// Reads the `BlockHeader` at `addr` by value.
    ///
    /// The memory is read without asserting that it holds a header written by
    /// the heap, so the result may contain arbitrary values.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockHeader` values.
    /// - The memory at `addr` must be within the provenance of `self`, valid
    ///   for reads for `size_of::<BlockHeader>()` bytes, and initialized.
    #[inline]
    pub unsafe fn read_header(self, addr: NonZeroUsize) -> RawHeader {
        debug_assert!(self.contains_addr(addr.get()));

        let ptr = self.with_addr(addr).cast::<RawHeader>().as_ptr();
        unsafe { ptr.read() }
    }
}

/// A header-sized view of arbitrary memory.
///
/// This mirrors the layout of [`BlockHeader`] but uses plain integers, so any
/// bit pattern is a valid value. It is used to validate addresses passed to
/// `deallocate` before the memory is trusted to hold a real header.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct RawHeader {
    pub self_addr: usize,
    pub next: usize,
    pub rank: u8,
    pub free: u8,
}

const _: () = assert!(mem::size_of::<RawHeader>() == mem::size_of::<BlockHeader>());
const _: () = assert!(mem::align_of::<RawHeader>() == mem::align_of::<BlockHeader>());
