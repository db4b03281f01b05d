//! Background staleness scanner.
//!
//! One detached thread, spawned at init: sleep, summarize, walk the index,
//! flag stale allocations. It never frees anything and never allocates on
//! its hot path -- all of its output goes through the non-allocating
//! diagnostic writer.

use core::ffi::c_void;

use crate::config;
use crate::diag::diag;
use crate::init;

/// Spawn the detached scanner thread. Returns false when thread creation
/// fails; the agent then runs without background scanning (`scan_once`
/// remains callable).
///
/// # Safety
/// Must be called during init, after the allocator is usable.
pub unsafe fn spawn() -> bool {
    let mut tid: libc::pthread_t = core::mem::zeroed();
    if libc::pthread_create(
        &mut tid,
        core::ptr::null(),
        scanner_main,
        core::ptr::null_mut(),
    ) != 0
    {
        return false;
    }
    libc::pthread_detach(tid);
    true
}

extern "C" fn scanner_main(_arg: *mut c_void) -> *mut c_void {
    let interval_ms = config::scan_interval_ms().max(1);
    loop {
        sleep_ms(interval_ms);

        let agent = unsafe { init::allocator() };
        let (allocs, frees, current) = agent.stats();
        diag!(
            "[SCANNER] live={} tracked={} dropped={} current={:.2} MiB",
            allocs.saturating_sub(frees),
            agent.tracked_count(),
            agent.dropped_count(),
            current as f64 / (1024.0 * 1024.0)
        );

        let found = agent.scan_once();
        if found > 0 {
            diag!("[SCANNER] flagged {} potential leaks", found);
        }
    }
}

fn sleep_ms(ms: u64) {
    let mut ts: libc::timespec = unsafe { core::mem::zeroed() };
    ts.tv_sec = (ms / 1000) as libc::time_t;
    ts.tv_nsec = ((ms % 1000) * 1_000_000) as _;
    unsafe {
        libc::nanosleep(&ts, core::ptr::null_mut());
    }
}
