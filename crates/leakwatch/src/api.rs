use core::ffi::c_void;

use crate::allocator::passthrough;
use crate::callsite;
use crate::diag::diag;
use crate::init::{self, STATE_DISABLED, STATE_READY};

/// Dispatch macro: route to the tracking agent once init has completed,
/// to the raw passthrough before then (including nested calls made by the
/// initializing thread itself) and when the agent is disabled.
macro_rules! dispatch {
    ($tracked:expr, $passthrough:expr) => {{
        match init::state() {
            STATE_READY => $tracked,
            STATE_DISABLED => $passthrough,
            _ => {
                if init::is_initializing_thread() {
                    $passthrough
                } else {
                    init::ensure_initialized();
                    match init::state() {
                        STATE_READY => $tracked,
                        _ => $passthrough,
                    }
                }
            }
        }
    }};
}

// ============================================================================
// Standard C allocator API
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let site = callsite::call_site();
    dispatch!(
        init::allocator().malloc(size, site) as *mut c_void,
        passthrough::malloc(size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    dispatch!(
        init::allocator().free(ptr as *mut u8),
        passthrough::free(ptr as *mut u8)
    );
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let site = callsite::call_site();
    dispatch!(
        init::allocator().realloc(ptr as *mut u8, size, site) as *mut c_void,
        passthrough::realloc(ptr as *mut u8, size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let site = callsite::call_site();
    dispatch!(
        init::allocator().calloc(nmemb, size, site) as *mut c_void,
        passthrough::calloc(nmemb, size) as *mut c_void
    )
}

/// For agent-stamped pointers this is the exact requested size; the real
/// allocator's accounting would misread a pointer that sits `HEADER_SIZE`
/// bytes into its block.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    dispatch!(
        init::allocator().usable_size(ptr as *mut u8),
        passthrough::malloc_usable_size(ptr as *mut u8)
    )
}

// ============================================================================
// Agent control surface
// ============================================================================

/// Record an access to `ptr` now. Called by external access-sampling
/// instrumentation; a no-op for foreign pointers.
#[no_mangle]
pub unsafe extern "C" fn update_access(ptr: *mut c_void) {
    if ptr.is_null() || init::state() != STATE_READY {
        return;
    }
    init::allocator().update_access(ptr as *mut u8);
}

/// Atomically replace the staleness threshold the scanner compares against.
#[no_mangle]
pub unsafe extern "C" fn set_staleness_threshold_seconds(seconds: f64) {
    if !seconds.is_finite() || seconds < 0.0 {
        return;
    }
    let ns = (seconds * 1e9) as u64;
    init::allocator().set_staleness_threshold_ns(ns);
    diag!("[AGENT] staleness threshold set to {:.2}s", seconds);
}

/// Load the statistics counters into the non-null out parameters.
#[no_mangle]
pub unsafe extern "C" fn get_stats(
    out_allocs: *mut u64,
    out_frees: *mut u64,
    out_current_mem: *mut u64,
) {
    let (allocs, frees, current) = init::allocator().stats();
    if !out_allocs.is_null() {
        *out_allocs = allocs;
    }
    if !out_frees.is_null() {
        *out_frees = frees;
    }
    if !out_current_mem.is_null() {
        *out_current_mem = current;
    }
}
