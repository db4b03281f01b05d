//! The shared-memory event ring.
//!
//! This is the wire format an out-of-process analyzer maps: a packed,
//! host-byte-order region header followed by a fixed array of packed event
//! slots. The producer protocol is claim-then-publish: a compare-exchange
//! on `write_index` hands the claiming thread exclusive ownership of one
//! slot, the claimant takes the slot's `is_valid` flag down, fills the
//! record, issues a full fence, and raises `is_valid` again with a release
//! store. A consumer samples `write_index` with acquire ordering, reads
//! the slot behind it, and trusts the record only when `is_valid` reads 1
//! -- 0 means empty or still being published.
//!
//! The ring is deliberately lossy: when the producer laps the consumer,
//! old slots are overwritten and the consumer detects the gap from the
//! jump in `event_id`. Stalling the allocator hot path is never an option.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{fence, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};

pub const RING_CAPACITY: usize = 1000;

/// Event discriminants as they appear on the wire.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    Malloc = 1,
    Free = 2,
    LeakDetected = 3,
    AccessPattern = 4,
}

/// 40-byte event payload. `time_ns` carries the allocation timestamp for
/// Malloc/Free events and the staleness for LeakDetected events.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventPayload {
    pub address: u64,
    pub size: u64,
    pub time_ns: u64,
    pub site_id: u32,
    reserved: [u8; 12],
}

impl EventPayload {
    pub fn new(address: u64, size: u64, time_ns: u64, site_id: u32) -> Self {
        EventPayload {
            address,
            size,
            time_ns,
            site_id,
            reserved: [0; 12],
        }
    }
}

/// One ring slot: 64 bytes, packed to the published layout.
/// `is_valid` is 0 in a never-written slot and 1 once published.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RawEvent {
    pub event_id: i32,
    pub event_type: i32,
    pub timestamp: u64,
    pub thread_id: u32,
    pub payload: EventPayload,
    pub is_valid: i32,
}

/// The mapped region. Never constructed as a value -- it describes memory
/// produced by `ftruncate` + `mmap`, and the consumer maps the same bytes.
#[repr(C, packed)]
pub struct RingRegion {
    pub write_index: u32,
    pub read_index: u32,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub current_memory: u64,
    pub leak_count: u32,
    pub events: [RawEvent; RING_CAPACITY],
}

pub const RING_REGION_SIZE: usize = size_of::<RingRegion>();

const _: () = assert!(size_of::<EventPayload>() == 40);
const _: () = assert!(size_of::<RawEvent>() == 64);
const _: () = assert!(RING_REGION_SIZE == 36 + 64 * RING_CAPACITY);

/// Shared statistics counters kept inside the region.
#[derive(Clone, Copy)]
pub enum RingCounter {
    TotalAllocations,
    TotalFrees,
    CurrentMemory,
}

/// Zero a freshly mapped region so `is_valid` reads 0 everywhere.
///
/// # Safety
/// `base` must map at least `RING_REGION_SIZE` writable bytes.
pub unsafe fn zero_region(base: *mut RingRegion) {
    ptr::write_bytes(base as *mut u8, 0, RING_REGION_SIZE);
}

// The control words sit at naturally aligned offsets (0, 8, 16, 24, 32) of
// a page-aligned mapping, so atomic views over them are sound even though
// the struct itself is packed. Each slot's `is_valid` lands at offset
// 96 + 64k, 4-aligned, so it too can carry an atomic view; the remaining
// slot fields are unaligned and only ever written by the slot's claimant.

#[inline]
unsafe fn write_index_at(base: *mut RingRegion) -> &'static AtomicU32 {
    &*(ptr::addr_of_mut!((*base).write_index) as *const AtomicU32)
}

#[inline]
unsafe fn counter_at(base: *mut RingRegion, counter: RingCounter) -> &'static AtomicU64 {
    let p = match counter {
        RingCounter::TotalAllocations => ptr::addr_of_mut!((*base).total_allocations),
        RingCounter::TotalFrees => ptr::addr_of_mut!((*base).total_frees),
        RingCounter::CurrentMemory => ptr::addr_of_mut!((*base).current_memory),
    };
    &*(p as *const AtomicU64)
}

#[inline]
unsafe fn leak_count_at(base: *mut RingRegion) -> &'static AtomicU32 {
    &*(ptr::addr_of_mut!((*base).leak_count) as *const AtomicU32)
}

#[inline]
unsafe fn slot_at(base: *mut RingRegion, slot: usize) -> *mut RawEvent {
    ptr::addr_of_mut!((*base).events).cast::<RawEvent>().add(slot)
}

#[inline]
unsafe fn published_flag_at(slot: *mut RawEvent) -> &'static AtomicI32 {
    &*(ptr::addr_of_mut!((*slot).is_valid) as *const AtomicI32)
}

/// Producer side of the ring. All operations are no-ops until a region is
/// attached, which is how the agent degrades to statistics-only mode.
pub struct RingProducer {
    region: AtomicPtr<RingRegion>,
    next_event_id: AtomicU32,
}

impl RingProducer {
    pub const fn new() -> Self {
        RingProducer {
            region: AtomicPtr::new(ptr::null_mut()),
            next_event_id: AtomicU32::new(1),
        }
    }

    /// Attach to a zeroed mapped region.
    pub fn attach(&self, region: *mut RingRegion) {
        self.region.store(region, Ordering::Release);
    }

    /// Detach, returning the region pointer for unmapping.
    pub fn detach(&self) -> *mut RingRegion {
        self.region.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    pub fn is_attached(&self) -> bool {
        !self.region.load(Ordering::Acquire).is_null()
    }

    /// Publish one event.
    ///
    /// The compare-exchange on `write_index` claims the slot first, so
    /// exactly one thread writes a given slot per lap -- concurrent
    /// publishers can never interleave stores into the same record. The
    /// claimant takes the slot's published flag down, fills the fields,
    /// and raises the flag again behind a full fence; `is_valid` is the
    /// per-slot publication flag the consumer checks after sampling
    /// `write_index`.
    pub fn publish(&self, kind: EventKind, payload: EventPayload, timestamp: u64, thread_id: u32) {
        let base = self.region.load(Ordering::Acquire);
        if base.is_null() {
            return;
        }
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed) as i32;
        unsafe {
            let widx = write_index_at(base);
            let mut w = widx.load(Ordering::Relaxed);
            loop {
                match widx.compare_exchange_weak(
                    w,
                    w.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => w = current,
                }
            }
            let slot = slot_at(base, w as usize % RING_CAPACITY);
            let published = published_flag_at(slot);
            // Take the slot down before rewriting it so a consumer cannot
            // pair the fresh fields with a stale published flag.
            published.store(0, Ordering::Release);
            ptr::write_unaligned(ptr::addr_of_mut!((*slot).event_id), event_id);
            ptr::write_unaligned(ptr::addr_of_mut!((*slot).event_type), kind as i32);
            ptr::write_unaligned(ptr::addr_of_mut!((*slot).timestamp), timestamp);
            ptr::write_unaligned(ptr::addr_of_mut!((*slot).thread_id), thread_id);
            ptr::write_unaligned(ptr::addr_of_mut!((*slot).payload), payload);
            // Every store above must be globally visible before the record
            // is flagged published; the consumer has no other
            // synchronization with this process.
            fence(Ordering::SeqCst);
            published.store(1, Ordering::Release);
        }
    }

    /// Relaxed add to one of the shared statistics counters.
    pub fn add(&self, counter: RingCounter, delta: u64) {
        let base = self.region.load(Ordering::Acquire);
        if base.is_null() {
            return;
        }
        unsafe { counter_at(base, counter).fetch_add(delta, Ordering::Relaxed) };
    }

    /// Relaxed subtract from one of the shared statistics counters.
    pub fn sub(&self, counter: RingCounter, delta: u64) {
        let base = self.region.load(Ordering::Acquire);
        if base.is_null() {
            return;
        }
        unsafe { counter_at(base, counter).fetch_sub(delta, Ordering::Relaxed) };
    }

    /// Relaxed increment of the shared leak counter.
    pub fn bump_leaks(&self) {
        let base = self.region.load(Ordering::Acquire);
        if base.is_null() {
            return;
        }
        unsafe { leak_count_at(base).fetch_add(1, Ordering::Relaxed) };
    }
}

impl Default for RingProducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side view over a mapped region: sample `write_index` with
/// acquire ordering, then load slots as whole unaligned records, trusting
/// a record only when its `is_valid` flag reads 1 (0 marks a slot that is
/// empty or mid-publication -- skip and resample). This is what the
/// external analyzer does; tests use it over a second mapping of the same
/// region.
pub struct RingReader {
    base: *const RingRegion,
}

impl RingReader {
    /// # Safety
    /// `base` must point to a naturally aligned mapping of at least
    /// `RING_REGION_SIZE` bytes that outlives the reader.
    pub unsafe fn new(base: *const RingRegion) -> Self {
        RingReader { base }
    }

    pub fn write_index(&self) -> u32 {
        unsafe { write_index_at(self.base as *mut RingRegion).load(Ordering::Acquire) }
    }

    /// Load the slot holding logical position `index`.
    pub fn event_at(&self, index: u32) -> RawEvent {
        unsafe {
            ptr::read_unaligned(slot_at(
                self.base as *mut RingRegion,
                index as usize % RING_CAPACITY,
            ))
        }
    }

    pub fn counter(&self, counter: RingCounter) -> u64 {
        unsafe { counter_at(self.base as *mut RingRegion, counter).load(Ordering::Relaxed) }
    }

    pub fn leak_count(&self) -> u32 {
        unsafe { leak_count_at(self.base as *mut RingRegion).load(Ordering::Relaxed) }
    }
}
