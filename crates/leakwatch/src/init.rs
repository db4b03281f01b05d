use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::allocator::passthrough;
use crate::allocator::TrackingAllocator;
use crate::config;
use crate::diag::diag;
use crate::platform::{self, SharedRegion};
use crate::ring::{self, RingRegion, RING_REGION_SIZE};
use crate::scanner;

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Fingerprint of the thread running init, so its own nested allocations
/// (dlsym, pthread_create) fall through to passthrough instead of waiting
/// for an init that cannot finish underneath them.
static INIT_THREAD: AtomicUsize = AtomicUsize::new(usize::MAX);

static ALLOCATOR: TrackingAllocator = TrackingAllocator::new();

/// The mapped region handle, kept for teardown.
struct RegionHolder(UnsafeCell<Option<SharedRegion>>);
unsafe impl Sync for RegionHolder {}

static REGION: RegionHolder = RegionHolder(UnsafeCell::new(None));

/// Library constructor -- called before main().
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        leakwatch_init();
    }
    init
};

/// Library destructor -- called at process exit.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".fini_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_term_func")]
static DTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn fini() {
        leakwatch_shutdown();
    }
    fini
};

pub unsafe fn leakwatch_init() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }
    INIT_THREAD.store(platform::thread_id() as usize, Ordering::Release);

    // Bind the real allocator first; everything below may allocate through
    // the passthrough.
    passthrough::resolve_real_functions();

    config::read_config();

    if config::is_disabled() {
        INIT_THREAD.store(usize::MAX, Ordering::Release);
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    ALLOCATOR.init(map_region());

    if config::scan_interval_ms() > 0 && !scanner::spawn() {
        diag!("[AGENT] scanner thread unavailable; staleness scanning disabled");
    }

    INIT_THREAD.store(usize::MAX, Ordering::Release);
    INIT_STATE.store(READY, Ordering::Release);
}

/// Create, size, map and zero the event region. On failure the agent keeps
/// running in statistics-only mode.
unsafe fn map_region() -> *mut RingRegion {
    match platform::map_shared_region(config::shm_name(), RING_REGION_SIZE) {
        Some(r) => {
            let base = r.ptr as *mut RingRegion;
            ring::zero_region(base);
            *REGION.0.get() = Some(r);
            base
        }
        None => {
            diag!(
                "[AGENT] shared region {:?} unavailable; running statistics-only",
                config::shm_name()
            );
            core::ptr::null_mut()
        }
    }
}

pub unsafe fn leakwatch_shutdown() {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        return;
    }
    let (allocs, frees, current) = ALLOCATOR.stats();
    diag!(
        "[AGENT] final stats: {} allocations, {} frees, {} bytes in flight, {} leaks flagged",
        allocs,
        frees,
        current,
        ALLOCATOR.leak_count()
    );
    ALLOCATOR.ring().detach();
    if let Some(region) = (*REGION.0.get()).take() {
        platform::unmap_shared_region(&region);
        platform::unlink_region(config::shm_name());
    }
}

#[cold]
#[inline(never)]
pub unsafe fn ensure_initialized() {
    leakwatch_init();
}

#[inline(always)]
pub unsafe fn allocator() -> &'static TrackingAllocator {
    &ALLOCATOR
}

#[inline(always)]
pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}

/// True when the calling thread is the one currently running init.
#[inline]
pub fn is_initializing_thread() -> bool {
    INIT_STATE.load(Ordering::Acquire) == INITIALIZING
        && INIT_THREAD.load(Ordering::Acquire) == platform::thread_id() as usize
}

pub const STATE_READY: u8 = READY;
pub const STATE_DISABLED: u8 = DISABLED;
