//! The tracking allocator: interposition semantics, statistics, and event
//! publication.
//!
//! Every serviced allocation gets `HEADER_SIZE` extra bytes in front, a
//! stamped header, an index entry, and a MALLOC event. The free path
//! recovers everything from the header in constant time. Foreign pointers
//! (whatever was allocated before the agent attached, or by a sibling
//! allocator) fail the magic test and pass straight through.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::allocator::passthrough;
use crate::config;
use crate::diag::diag;
use crate::header::{AllocHeader, HEADER_SIZE};
use crate::index::LiveIndex;
use crate::platform;
use crate::ring::{EventKind, EventPayload, RingCounter, RingProducer, RingRegion};

pub struct TrackingAllocator {
    index: LiveIndex,
    ring: RingProducer,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
    current_memory: AtomicU64,
    leak_count: AtomicU64,
    staleness_ns: AtomicU64,
}

impl TrackingAllocator {
    pub const fn new() -> Self {
        TrackingAllocator {
            index: LiveIndex::new(),
            ring: RingProducer::new(),
            total_allocations: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            current_memory: AtomicU64::new(0),
            leak_count: AtomicU64::new(0),
            staleness_ns: AtomicU64::new(config::DEFAULT_STALENESS_NS),
        }
    }

    /// Wire up configuration and the shared region. Called once from init.
    /// With a null region the agent runs statistics-only: every publish
    /// becomes a no-op.
    pub fn init(&self, region: *mut RingRegion) {
        self.staleness_ns
            .store(config::staleness_ns(), Ordering::Relaxed);
        if !region.is_null() {
            self.ring.attach(region);
        }
    }

    /// # Safety
    /// Standard malloc contract.
    pub unsafe fn malloc(&self, size: usize, site_id: u32) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let total = match size.checked_add(HEADER_SIZE) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let base = passthrough::malloc(total);
        if base.is_null() {
            return ptr::null_mut();
        }
        let tid = platform::thread_id();
        let user = AllocHeader::install(base, size, site_id, tid);
        let header_ptr = AllocHeader::from_user_ptr(user);
        let header = &*header_ptr;

        self.index.insert(user, header_ptr);

        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.current_memory.fetch_add(size as u64, Ordering::Relaxed);
        self.ring.add(RingCounter::TotalAllocations, 1);
        self.ring.add(RingCounter::CurrentMemory, size as u64);

        self.ring.publish(
            EventKind::Malloc,
            EventPayload::new(user as u64, size as u64, header.alloc_time(), site_id),
            header.alloc_time(),
            tid,
        );
        user
    }

    /// # Safety
    /// `ptr` must be null or a live allocation pointer.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() || passthrough::is_bootstrap_ptr(ptr) {
            return;
        }
        let header = AllocHeader::from_user_ptr(ptr);
        if !(*header).is_valid() {
            // Foreign allocation, or a double free after the magic was
            // cleared: the real allocator gets the raw pointer unchanged
            // and may diagnose it itself. No event, no counters.
            passthrough::free(ptr);
            return;
        }
        let h = &*header;
        let size = h.size();

        self.total_frees.fetch_add(1, Ordering::Relaxed);
        self.current_memory.fetch_sub(size as u64, Ordering::Relaxed);
        self.ring.add(RingCounter::TotalFrees, 1);
        self.ring.sub(RingCounter::CurrentMemory, size as u64);

        self.index.remove(ptr);

        self.ring.publish(
            EventKind::Free,
            EventPayload::new(ptr as u64, size as u64, h.alloc_time(), h.site_id()),
            platform::monotonic_ns(),
            platform::thread_id(),
        );

        h.invalidate();
        passthrough::free(header as *mut u8);
    }

    /// Always allocate-copy-free; this agent trades realloc performance for
    /// a uniform event stream.
    ///
    /// # Safety
    /// Standard realloc contract.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, site_id: u32) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(new_size, site_id);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if passthrough::is_bootstrap_ptr(ptr) {
            return passthrough::realloc(ptr, new_size);
        }
        let header = AllocHeader::from_user_ptr(ptr);
        if !(*header).is_valid() {
            return passthrough::realloc(ptr, new_size);
        }
        let old_size = (*header).size();
        let new_ptr = self.malloc(new_size, site_id);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        self.free(ptr);
        new_ptr
    }

    /// # Safety
    /// Standard calloc contract.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize, site_id: u32) -> *mut u8 {
        let total = match nmemb.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let p = self.malloc(total, site_id);
        if !p.is_null() {
            ptr::write_bytes(p, 0, total);
        }
        p
    }

    /// # Safety
    /// `ptr` must be null or a live allocation pointer.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() || passthrough::is_bootstrap_ptr(ptr) {
            return 0;
        }
        let header = AllocHeader::from_user_ptr(ptr);
        if (*header).is_valid() {
            (*header).size()
        } else {
            passthrough::malloc_usable_size(ptr)
        }
    }

    /// Record an access to `ptr` now. Idempotent; foreign pointers ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation pointer.
    pub unsafe fn update_access(&self, ptr: *mut u8) {
        if ptr.is_null() || passthrough::is_bootstrap_ptr(ptr) {
            return;
        }
        let header = AllocHeader::from_user_ptr(ptr);
        if (*header).is_valid() {
            (*header).touch();
        }
    }

    pub fn set_staleness_threshold_ns(&self, ns: u64) {
        self.staleness_ns.store(ns, Ordering::Relaxed);
    }

    pub fn staleness_threshold_ns(&self) -> u64 {
        self.staleness_ns.load(Ordering::Relaxed)
    }

    /// (total_allocations, total_frees, current_memory), relaxed loads.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.total_allocations.load(Ordering::Relaxed),
            self.total_frees.load(Ordering::Relaxed),
            self.current_memory.load(Ordering::Relaxed),
        )
    }

    pub fn leak_count(&self) -> u64 {
        self.leak_count.load(Ordering::Relaxed)
    }

    pub fn tracked_count(&self) -> usize {
        self.index.live_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.index.dropped_count()
    }

    pub fn ring(&self) -> &RingProducer {
        &self.ring
    }

    pub fn index(&self) -> &LiveIndex {
        &self.index
    }

    /// One scanner pass: flag every tracked allocation whose last access is
    /// older than the threshold. Returns the number of leaks flagged.
    ///
    /// Racy against concurrent frees by design: an entry removed mid-walk
    /// is never seen, and an invalidated header fails the magic test.
    pub fn scan_once(&self) -> usize {
        let threshold = self.staleness_ns.load(Ordering::Relaxed);
        let now = platform::monotonic_ns();
        let mut found = 0usize;
        self.index.for_each(|user, header| {
            let h = unsafe { &*header };
            if !h.is_valid() {
                return;
            }
            let staleness = h.staleness(now);
            if staleness <= threshold {
                return;
            }
            self.ring.publish(
                EventKind::LeakDetected,
                EventPayload::new(user as u64, h.size() as u64, staleness, h.site_id()),
                now,
                platform::thread_id(),
            );
            self.ring.bump_leaks();
            self.leak_count.fetch_add(1, Ordering::Relaxed);
            diag!(
                "[LEAK] {:#x}: {} bytes, stale for {:.2}s, site_id={}",
                user as usize,
                h.size(),
                staleness as f64 / 1e9,
                h.site_id()
            );
            found += 1;
        });
        found
    }
}
