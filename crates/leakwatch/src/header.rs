//! The in-band allocation header.
//!
//! Every allocation the agent serves carries its metadata immediately
//! before the user pointer, so user pointer and header convert both ways
//! with one constant offset -- no table lookup on the free path.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::platform;

/// Sentinel distinguishing agent-stamped allocations from foreign pointers
/// (allocations made before attach, or by a sibling allocator).
pub const HEADER_MAGIC: u32 = 0xDEAD_BEEF;

/// Per-allocation metadata preceding the user pointer.
///
/// 16-byte alignment keeps user pointers on the same boundaries the real
/// allocator guarantees. `magic` and `last_access` are atomic because the
/// scanner reads them while the owning thread frees or touches the block.
#[repr(C, align(16))]
pub struct AllocHeader {
    magic: AtomicU32,
    size: u64,
    alloc_time: u64,
    last_access: AtomicU64,
    site_id: u32,
    thread_id: u32,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();

const _: () = assert!(HEADER_SIZE == 48);
const _: () = assert!(HEADER_SIZE % crate::util::MIN_ALIGN == 0);

impl AllocHeader {
    /// Stamp a fresh header at `base` and return the user pointer.
    ///
    /// # Safety
    /// `base` must point to at least `HEADER_SIZE` writable bytes, aligned
    /// for `AllocHeader`.
    pub unsafe fn install(base: *mut u8, size: usize, site_id: u32, thread_id: u32) -> *mut u8 {
        let now = platform::monotonic_ns();
        let h = base as *mut AllocHeader;
        (*h).magic = AtomicU32::new(HEADER_MAGIC);
        (*h).size = size as u64;
        (*h).alloc_time = now;
        (*h).last_access = AtomicU64::new(now);
        (*h).site_id = site_id;
        (*h).thread_id = thread_id;
        base.add(HEADER_SIZE)
    }

    /// Recover the header pointer from a user pointer. Pure pointer
    /// arithmetic -- nothing is dereferenced.
    #[inline(always)]
    pub fn from_user_ptr(user: *mut u8) -> *mut AllocHeader {
        user.wrapping_sub(HEADER_SIZE) as *mut AllocHeader
    }

    /// The user pointer belonging to this header.
    #[inline(always)]
    pub fn user_ptr(&self) -> *mut u8 {
        (self as *const AllocHeader as *mut u8).wrapping_add(HEADER_SIZE)
    }

    /// The sole recognition test: does the sentinel match?
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == HEADER_MAGIC
    }

    /// Clear the sentinel so a later free of the same pointer reads as
    /// foreign (double-free shows up as a magic mismatch, not a crash here).
    #[inline]
    pub fn invalidate(&self) {
        self.magic.store(0, Ordering::Release);
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline(always)]
    pub fn alloc_time(&self) -> u64 {
        self.alloc_time
    }

    #[inline(always)]
    pub fn site_id(&self) -> u32 {
        self.site_id
    }

    #[inline(always)]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Record an access now.
    #[inline]
    pub fn touch(&self) {
        self.last_access
            .store(platform::monotonic_ns(), Ordering::Release);
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Nanoseconds since the last recorded access.
    #[inline]
    pub fn staleness(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access())
    }
}
