//! Live-allocation index.
//!
//! A bounded open-addressed table keyed by user pointer, holding the set of
//! allocations the scanner walks. Every operation runs lock-free on atomic
//! slots: the interposer may be re-entered by the real allocator itself, so
//! no allocation path here may wait on a mutex.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::header::AllocHeader;

/// Hard cap on tracked live allocations. Past the cap, new allocations stay
/// live and traceable through their header but invisible to the scanner.
pub const MAX_TRACKED: usize = 10_000;

/// Slot count. Power of two, sized so the table stays under ~75% load at
/// the tracking cap.
const SLOT_COUNT: usize = 16_384;

const EMPTY: usize = 0;
const TOMBSTONE: usize = 1;

struct Slot {
    /// User pointer, or EMPTY / TOMBSTONE.
    key: AtomicUsize,
    /// Header pointer; 0 until the entry is fully published.
    header: AtomicUsize,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            key: AtomicUsize::new(EMPTY),
            header: AtomicUsize::new(0),
        }
    }
}

pub struct LiveIndex {
    slots: [Slot; SLOT_COUNT],
    live: AtomicUsize,
    dropped: AtomicU64,
}

impl LiveIndex {
    pub const fn new() -> Self {
        const SLOT: Slot = Slot::new();
        LiveIndex {
            slots: [SLOT; SLOT_COUNT],
            live: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a live allocation. Returns false when the entry was dropped
    /// (cap reached or table exhausted); the allocation itself proceeds
    /// either way.
    pub fn insert(&self, user_ptr: *mut u8, header: *mut AllocHeader) -> bool {
        if self.live.load(Ordering::Relaxed) >= MAX_TRACKED {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let key = user_ptr as usize;
        let mask = SLOT_COUNT - 1;
        let mut idx = hash_ptr(key) & mask;
        for _ in 0..SLOT_COUNT {
            let slot = &self.slots[idx];
            let k = slot.key.load(Ordering::Acquire);
            if k == EMPTY || k == TOMBSTONE {
                if slot
                    .key
                    .compare_exchange(k, key, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.header.store(header as usize, Ordering::Release);
                    self.live.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                // Lost the slot to a concurrent insert; keep probing.
            }
            idx = (idx + 1) & mask;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Unregister an allocation. Returns true when an entry was found.
    pub fn remove(&self, user_ptr: *mut u8) -> bool {
        let key = user_ptr as usize;
        let mask = SLOT_COUNT - 1;
        let mut idx = hash_ptr(key) & mask;
        for _ in 0..SLOT_COUNT {
            let slot = &self.slots[idx];
            let k = slot.key.load(Ordering::Acquire);
            if k == EMPTY {
                return false;
            }
            if k == key {
                slot.header.store(0, Ordering::Release);
                // CAS so two racing removes cannot both decrement. A
                // tombstone is never recycled back to EMPTY: probe chains
                // running through it must stay intact.
                if slot
                    .key
                    .compare_exchange(key, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.live.fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
                return false;
            }
            idx = (idx + 1) & mask;
        }
        false
    }

    /// Visit every tracked (user pointer, header) pair. Entries inserted or
    /// removed during the walk may or may not be seen; a half-published
    /// entry (header still 0) is skipped.
    pub fn for_each(&self, mut f: impl FnMut(*mut u8, *const AllocHeader)) {
        for slot in &self.slots {
            let k = slot.key.load(Ordering::Acquire);
            if k == EMPTY || k == TOMBSTONE {
                continue;
            }
            let h = slot.header.load(Ordering::Acquire);
            if h == 0 {
                continue;
            }
            f(k as *mut u8, h as *const AllocHeader);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Allocations that could not be tracked (cap or table exhaustion).
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// splitmix64 finalizer for proper distribution of pointer keys.
#[inline]
fn hash_ptr(key: usize) -> usize {
    crate::util::splitmix64(key as u64) as usize
}
