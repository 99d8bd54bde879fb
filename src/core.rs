//! Re-exports of `core`, plus stable polyfills.
//!
//! The stable-compatible implementations in this module follow the standard
//! library's strict-provenance API, delegating to `sptr` for raw pointers.

pub use core::{fmt, mem};

pub(crate) mod alloc {
    pub use core::alloc::*;
}

pub(crate) mod num {
    pub use core::num::*;
}

#[cfg(not(feature = "sptr"))]
pub(crate) use core::ptr;

#[cfg(feature = "sptr")]
pub(crate) mod ptr {
    pub use core::ptr::*;

    use core::num::NonZeroUsize;

    pub use sptr::Strict;

    pub trait NonNullStrict<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized;

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized;
    }

    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null,
            // meaning that the address will be non-zero.
            unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
        }

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized,
        {
            // SAFETY: The result of `ptr::with_addr` is non-null because `addr`
            // is guaranteed to be non-zero.
            unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
        }
    }

}
