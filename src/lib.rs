//! A fixed-pool binary buddy allocator.
//!
//! [`BuddyHeap`] serves variable-sized requests out of one contiguous region
//! by rounding them up to power-of-two block sizes, splitting larger free
//! blocks on demand and coalescing freed buddies back together. Each block
//! carries an in-band header of [`HEADER_SIZE`] bytes, so no memory beyond the
//! region itself is needed for bookkeeping.
//!
//! ```
//! use core::ptr::NonNull;
//!
//! use buddy_heap::BuddyHeap;
//!
//! let mut region = [0u64; 512];
//! let ptr = NonNull::new(region.as_mut_ptr().cast::<u8>()).unwrap();
//!
//! // SAFETY: `region` outlives the heap and is only accessed through it.
//! let mut heap = unsafe { BuddyHeap::new_raw(ptr, 4096) }.unwrap();
//!
//! let block = heap.allocate(1000).unwrap();
//! assert!(block.len() >= 1000);
//! assert_eq!(heap.pending(), 1);
//!
//! unsafe { heap.deallocate(block.cast()).unwrap() };
//! assert_eq!(heap.pending(), 0);
//! ```
//!
//! A `BuddyHeap` is not thread-safe. Callers sharing one between threads must
//! serialize every operation on it, e.g. behind a single mutex.

#![doc(html_root_url = "https://docs.rs/buddy_heap/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(
    all(feature = "unstable", not(feature = "sptr")),
    feature(strict_provenance)
)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods provided by unstable
// features.
#![allow(unstable_name_collisions)]

#[cfg(not(any(feature = "sptr", feature = "unstable")))]
compile_error!("At least one of these crate features must be enabled: [\"sptr\", \"unstable\"].");

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

// Stand-ins for the `log` macros when logging is disabled.
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

mod base;
pub mod buddy;
mod core;
pub mod rank;
mod registry;


use ::core::{alloc::Layout, ptr::NonNull};

pub use crate::{
    base::HEADER_SIZE,
    buddy::{BuddyHeap, HeapStats},
};

/// The error type for heap constructors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    #[error("failed to allocate a heap region of {} bytes", .0.size())]
    AllocFailed(Layout),

    /// The configuration of the heap is invalid.
    ///
    /// This variant is returned when the region is too small to hold a root
    /// block, is misaligned for block headers, or extends past the end of the
    /// address space.
    #[error("invalid heap region")]
    InvalidConfig,
}

/// Indicates an allocation failure due to resource exhaustion.
///
/// No free block is large enough for the request, although the total amount
/// of free memory may be.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("no free block is large enough for the request")]
pub struct AllocError;

/// The error type for [`BuddyHeap::deallocate`].
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum FreeError {
    /// The pointer does not refer to the payload of a block of this heap.
    #[error("pointer does not refer to a block of this heap")]
    InvalidPointer,

    /// The pointer refers to a block that is already free.
    #[error("block is already free")]
    DoubleFree,
}

/// Types which provide memory which backs a heap.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that a heap is not backed by another
///   allocator. This is the case when constructing the heap from raw
///   pointers. Memory used by this heap can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that a heap is backed by the global
///   allocator. The heap will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a heap is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
