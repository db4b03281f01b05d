//! Passthrough to the real allocator.
//!
//! This library exports `malloc`/`free`/`realloc`/`calloc`, so calling
//! `libc::malloc` from inside it would loop straight back here. The real
//! implementations are found with dlsym(RTLD_NEXT). dlsym itself may
//! allocate on some libcs; those nested requests are served from a static
//! bump buffer until the handles are bound.

use core::ffi::{c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::platform;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> libc::c_int;
type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

/// One lazily resolved symbol of the underlying allocator.
struct Handle {
    addr: AtomicUsize,
    name: &'static CStr,
}

/// Thread fingerprint of a thread currently inside dlsym, so a nested
/// allocation from the resolver itself falls through to the bump buffer
/// instead of recursing.
static RESOLVING_THREAD: AtomicUsize = AtomicUsize::new(usize::MAX);

impl Handle {
    const fn new(name: &'static CStr) -> Self {
        Handle {
            addr: AtomicUsize::new(0),
            name,
        }
    }

    #[inline]
    fn get(&self) -> usize {
        let a = self.addr.load(Ordering::Acquire);
        if a != 0 {
            a
        } else {
            self.resolve()
        }
    }

    /// dlsym(RTLD_NEXT) the symbol; concurrent resolvers converge on the
    /// same address via compare-exchange.
    #[cold]
    #[inline(never)]
    fn resolve(&self) -> usize {
        let me = platform::thread_id() as usize;
        if RESOLVING_THREAD.load(Ordering::Relaxed) == me {
            return 0;
        }
        RESOLVING_THREAD.store(me, Ordering::Relaxed);
        let rtld_next = -1isize as *mut c_void; // RTLD_NEXT
        let p = unsafe { libc::dlsym(rtld_next, self.name.as_ptr()) };
        RESOLVING_THREAD.store(usize::MAX, Ordering::Relaxed);
        if p.is_null() {
            return 0;
        }
        let _ = self
            .addr
            .compare_exchange(0, p as usize, Ordering::Release, Ordering::Acquire);
        self.addr.load(Ordering::Acquire)
    }
}

static REAL_MALLOC: Handle = Handle::new(c"malloc");
static REAL_FREE: Handle = Handle::new(c"free");
static REAL_REALLOC: Handle = Handle::new(c"realloc");
static REAL_CALLOC: Handle = Handle::new(c"calloc");
static REAL_POSIX_MEMALIGN: Handle = Handle::new(c"posix_memalign");
static REAL_USABLE_SIZE: Handle = Handle::new(c"malloc_usable_size");

/// Resolve every handle eagerly. Called once during init so the hot path
/// normally never sees an unresolved handle.
pub fn resolve_real_functions() {
    REAL_MALLOC.get();
    REAL_FREE.get();
    REAL_REALLOC.get();
    REAL_CALLOC.get();
    REAL_POSIX_MEMALIGN.get();
    REAL_USABLE_SIZE.get();
}

// ----------------------------------------------------------------------------
// Bootstrap bump buffer
//
// Serves allocations made while dlsym is resolving (dlsym may calloc).
// Never reclaimed; free of a bootstrap pointer is a no-op.
// ----------------------------------------------------------------------------

const BOOTSTRAP_LEN: usize = 65536;
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);
static mut BOOTSTRAP_BUF: [u8; BOOTSTRAP_LEN] = [0; BOOTSTRAP_LEN];

unsafe fn bootstrap_alloc(size: usize) -> *mut u8 {
    let aligned = (size + 15) & !15;
    // CAS loop so a failed reservation never advances the cursor.
    loop {
        let offset = BOOTSTRAP_USED.load(Ordering::Relaxed);
        if offset + aligned > BOOTSTRAP_LEN {
            return ptr::null_mut();
        }
        if BOOTSTRAP_USED
            .compare_exchange_weak(
                offset,
                offset + aligned,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return ptr::addr_of_mut!(BOOTSTRAP_BUF).cast::<u8>().add(offset);
        }
    }
}

/// Whether `ptr` points into the bootstrap buffer.
pub fn is_bootstrap_ptr(ptr: *const u8) -> bool {
    let base = core::ptr::addr_of!(BOOTSTRAP_BUF) as usize;
    let p = ptr as usize;
    (base..base + BOOTSTRAP_LEN).contains(&p)
}

// ----------------------------------------------------------------------------
// Forwarders
// ----------------------------------------------------------------------------

/// # Safety
/// Standard malloc contract.
#[inline]
pub unsafe fn malloc(size: usize) -> *mut u8 {
    let f = REAL_MALLOC.get();
    if f != 0 {
        let func: MallocFn = core::mem::transmute(f);
        func(size) as *mut u8
    } else {
        bootstrap_alloc(size)
    }
}

/// # Safety
/// `ptr` must be null or a pointer the real allocator owns.
#[inline]
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    let f = REAL_FREE.get();
    if f != 0 {
        let func: FreeFn = core::mem::transmute(f);
        func(ptr as *mut c_void);
    }
}

/// # Safety
/// `ptr` must be null or a pointer the real allocator owns.
#[inline]
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return malloc(size);
    }
    if is_bootstrap_ptr(ptr) {
        // Bootstrap memory cannot be resized in place; copy what could
        // possibly have been there.
        let new = malloc(size);
        if !new.is_null() {
            let base = core::ptr::addr_of!(BOOTSTRAP_BUF) as usize;
            let max_old = BOOTSTRAP_LEN - (ptr as usize - base);
            ptr::copy_nonoverlapping(ptr, new, size.min(max_old));
        }
        return new;
    }
    let f = REAL_REALLOC.get();
    if f != 0 {
        let func: ReallocFn = core::mem::transmute(f);
        func(ptr as *mut c_void, size) as *mut u8
    } else {
        ptr::null_mut()
    }
}

/// # Safety
/// Standard calloc contract.
#[inline]
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let f = REAL_CALLOC.get();
    if f != 0 {
        let func: CallocFn = core::mem::transmute(f);
        func(nmemb, size) as *mut u8
    } else {
        let total = match nmemb.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let p = bootstrap_alloc(total);
        if !p.is_null() {
            ptr::write_bytes(p, 0, total);
        }
        p
    }
}

/// # Safety
/// `alignment` must be a power of two and a multiple of sizeof(void*).
#[inline]
pub unsafe fn memalign(alignment: usize, size: usize) -> *mut u8 {
    let f = REAL_POSIX_MEMALIGN.get();
    if f == 0 {
        return ptr::null_mut();
    }
    let func: PosixMemalignFn = core::mem::transmute(f);
    let mut out: *mut c_void = ptr::null_mut();
    if func(&mut out, alignment, size) == 0 {
        out as *mut u8
    } else {
        ptr::null_mut()
    }
}

/// # Safety
/// `ptr` must be a pointer the real allocator owns.
#[inline]
pub unsafe fn malloc_usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return 0;
    }
    let f = REAL_USABLE_SIZE.get();
    if f != 0 {
        let func: UsableSizeFn = core::mem::transmute(f);
        func(ptr as *mut c_void)
    } else {
        0
    }
}
