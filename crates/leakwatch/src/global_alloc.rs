//! `#[global_allocator]` support for leakwatch.
//!
//! Lets a Rust host route its own heap through the tracking agent without
//! LD_PRELOAD:
//!
//! ```rust,ignore
//! use leakwatch::Leakwatch;
//!
//! #[global_allocator]
//! static GLOBAL: Leakwatch = Leakwatch;
//! ```

use core::alloc::{GlobalAlloc, Layout};

use crate::allocator::passthrough;
use crate::callsite;
use crate::init::{self, STATE_READY};
use crate::util::MIN_ALIGN;

/// A zero-sized unit struct that implements [`GlobalAlloc`] by delegating
/// to the tracking agent.
///
/// Layouts aligned beyond [`MIN_ALIGN`] cannot carry the in-band header
/// (the header offset would break the alignment), so they go through the
/// real allocator's memalign untracked; the magic test routes their free
/// back to the real allocator as well.
pub struct Leakwatch;

unsafe impl GlobalAlloc for Leakwatch {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        // Zero-size types: return a well-aligned dangling pointer, the
        // standard library's own pattern.
        if size == 0 {
            return align as *mut u8;
        }

        init::ensure_initialized();
        if align > MIN_ALIGN {
            return passthrough::memalign(align, size);
        }
        if init::state() == STATE_READY {
            init::allocator().malloc(size, callsite::call_site())
        } else {
            passthrough::malloc(size)
        }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        if size == 0 {
            return align as *mut u8;
        }

        init::ensure_initialized();
        if align > MIN_ALIGN {
            let ptr = passthrough::memalign(align, size);
            if !ptr.is_null() {
                core::ptr::write_bytes(ptr, 0, size);
            }
            return ptr;
        }
        if init::state() == STATE_READY {
            init::allocator().calloc(1, size, callsite::call_site())
        } else {
            passthrough::calloc(1, size)
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // A valid ptr implies alloc() already ran, so init has completed.
        if init::state() == STATE_READY {
            init::allocator().free(ptr);
        } else {
            passthrough::free(ptr);
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        let align = layout.align();

        if old_size == 0 {
            return self.alloc(Layout::from_size_align_unchecked(new_size, align));
        }

        if align > MIN_ALIGN {
            // Over-aligned blocks are untracked memalign memory; resize by
            // hand to preserve the alignment.
            let new_ptr = passthrough::memalign(align, new_size);
            if !new_ptr.is_null() {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
                self.dealloc(ptr, layout);
            }
            return new_ptr;
        }

        if init::state() == STATE_READY {
            init::allocator().realloc(ptr, new_size, callsite::call_site())
        } else {
            passthrough::realloc(ptr, new_size)
        }
    }
}
