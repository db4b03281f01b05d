/// Signal-reentrancy test for the leakwatch agent.
///
/// Two signal paths probe the agent's own structures rather than the
/// underlying allocator:
///
/// - SIGALRM arrives from a 1ms interval timer, so it lands at arbitrary
///   points inside the interposer -- between a free's index removal and
///   its header invalidation, inside the index probe loops, inside the
///   ring's claim-and-publish sequence. Its handler stays allocation-free
///   and exercises only the agent's lock-free control surface:
///   update_access and malloc_usable_size against a live sentinel (header
///   magic and size must read consistently no matter where the
///   interruption landed) and get_stats (counter coherence).
/// - SIGUSR1 is raised explicitly between operations; its handler
///   re-enters the full interposer on the same thread -- malloc, write,
///   update_access, usable_size, free -- driving nested header stamping,
///   index insert/remove and ring publication. Every structure on that
///   path is built on atomics, so the nested entry must complete; a lock
///   anywhere in the agent would deadlock right here.
///
/// Handlers record anomalies in counters instead of asserting (no
/// formatting inside a signal handler); main verifies at the end.
///
/// Run with: rustc -O tests/signal_safety/signal_test.rs -o target/signal_test && \
///           timeout 20 env LD_PRELOAD=target/release/libleakwatch.so target/signal_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

extern "C" {
    fn malloc(size: usize) -> *mut u8;
    fn free(ptr: *mut u8);
    fn realloc(ptr: *mut u8, size: usize) -> *mut u8;
    fn malloc_usable_size(ptr: *mut u8) -> usize;
    fn raise(sig: i32) -> i32;
    fn sigaction(signum: i32, act: *const SigAction, oldact: *mut SigAction) -> i32;
    fn sigemptyset(set: *mut [u64; 16]) -> i32;
    fn setitimer(which: i32, new: *const ITimerVal, old: *mut ITimerVal) -> i32;
    fn dlsym(handle: *mut u8, name: *const u8) -> *mut u8;
}

const SIGUSR1: i32 = 10;
const SIGALRM: i32 = 14;
const SA_RESTART: i32 = 0x10000000;
const ITIMER_REAL: i32 = 0;

#[repr(C)]
struct SigAction {
    sa_sigaction: usize,
    sa_mask: [u64; 16],
    sa_flags: i32,
    sa_restorer: usize,
}

#[repr(C)]
struct TimeVal {
    tv_sec: i64,
    tv_usec: i64,
}

#[repr(C)]
struct ITimerVal {
    it_interval: TimeVal,
    it_value: TimeVal,
}

/// The agent's control symbols, resolved at runtime so the binary links
/// without the preload and can detect its absence.
static UPDATE_ACCESS: AtomicUsize = AtomicUsize::new(0);
static GET_STATS: AtomicUsize = AtomicUsize::new(0);

type UpdateAccessFn = unsafe extern "C" fn(*mut u8);
type GetStatsFn = unsafe extern "C" fn(*mut u64, *mut u64, *mut u64);

/// Long-lived allocation the timer handler probes; never freed while the
/// timer is armed.
static SENTINEL: AtomicUsize = AtomicUsize::new(0);
const SENTINEL_SIZE: usize = 256;
const SENTINEL_BYTE: u8 = 0xC3;

static ALRM_COUNT: AtomicUsize = AtomicUsize::new(0);
static USR1_COUNT: AtomicUsize = AtomicUsize::new(0);
static NESTED_CYCLES_OK: AtomicUsize = AtomicUsize::new(0);
static SIZE_MISMATCHES: AtomicUsize = AtomicUsize::new(0);
static SENTINEL_CORRUPTIONS: AtomicUsize = AtomicUsize::new(0);
static STATS_INCOHERENT: AtomicUsize = AtomicUsize::new(0);

unsafe fn agent_update_access(ptr: *mut u8) {
    let f = UPDATE_ACCESS.load(Ordering::Relaxed);
    if f != 0 {
        let f: UpdateAccessFn = std::mem::transmute(f);
        f(ptr);
    }
}

unsafe fn agent_get_stats() -> Option<(u64, u64, u64)> {
    let f = GET_STATS.load(Ordering::Relaxed);
    if f == 0 {
        return None;
    }
    let f: GetStatsFn = std::mem::transmute(f);
    let (mut allocs, mut frees, mut current) = (0u64, 0u64, 0u64);
    f(&mut allocs, &mut frees, &mut current);
    Some((allocs, frees, current))
}

/// SIGALRM: allocation-free probe of the agent's atomics, valid at any
/// interruption point.
extern "C" fn sigalrm_handler(_sig: i32) {
    ALRM_COUNT.fetch_add(1, Ordering::Relaxed);
    unsafe {
        let s = SENTINEL.load(Ordering::Acquire) as *mut u8;
        if !s.is_null() {
            agent_update_access(s);
            if *s != SENTINEL_BYTE {
                SENTINEL_CORRUPTIONS.fetch_add(1, Ordering::Relaxed);
            }
            // Header-trick accounting: the stamped size must survive any
            // half-finished operation elsewhere in the agent.
            if UPDATE_ACCESS.load(Ordering::Relaxed) != 0
                && malloc_usable_size(s) != SENTINEL_SIZE
            {
                SIZE_MISMATCHES.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some((allocs, frees, _)) = agent_get_stats() {
            if frees > allocs {
                STATS_INCOHERENT.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// SIGUSR1: full nested interposer cycle on the interrupted thread.
extern "C" fn sigusr1_handler(_sig: i32) {
    USR1_COUNT.fetch_add(1, Ordering::Relaxed);
    unsafe {
        let p = malloc(48);
        if p.is_null() {
            return;
        }
        std::ptr::write_bytes(p, 0x5A, 48);
        agent_update_access(p);
        if UPDATE_ACCESS.load(Ordering::Relaxed) != 0 && malloc_usable_size(p) != 48 {
            SIZE_MISMATCHES.fetch_add(1, Ordering::Relaxed);
        }
        free(p);
        NESTED_CYCLES_OK.fetch_add(1, Ordering::Relaxed);
    }
}

fn install_handler(sig: i32, handler: extern "C" fn(i32)) {
    unsafe {
        let mut sa = SigAction {
            sa_sigaction: handler as usize,
            sa_mask: [0; 16],
            sa_flags: SA_RESTART,
            sa_restorer: 0,
        };
        sigemptyset(&mut sa.sa_mask);
        sigaction(sig, &sa, std::ptr::null_mut());
    }
}

fn set_interval_timer(usec: i64) {
    let it = ITimerVal {
        it_interval: TimeVal {
            tv_sec: 0,
            tv_usec: usec,
        },
        it_value: TimeVal {
            tv_sec: 0,
            tv_usec: usec,
        },
    };
    unsafe { setitimer(ITIMER_REAL, &it, std::ptr::null_mut()) };
}

fn main() {
    println!("leakwatch signal-reentrancy test");

    unsafe {
        UPDATE_ACCESS.store(
            dlsym(std::ptr::null_mut(), b"update_access\0".as_ptr()) as usize,
            Ordering::Relaxed,
        );
        GET_STATS.store(
            dlsym(std::ptr::null_mut(), b"get_stats\0".as_ptr()) as usize,
            Ordering::Relaxed,
        );
    }
    let agent_present = UPDATE_ACCESS.load(Ordering::Relaxed) != 0;
    println!(
        "agent control surface: {}",
        if agent_present {
            "resolved"
        } else {
            "absent (run under LD_PRELOAD); allocator churn only"
        }
    );

    let sentinel = unsafe { malloc(SENTINEL_SIZE) };
    assert!(!sentinel.is_null());
    unsafe { std::ptr::write_bytes(sentinel, SENTINEL_BYTE, SENTINEL_SIZE) };
    SENTINEL.store(sentinel as usize, Ordering::Release);

    install_handler(SIGALRM, sigalrm_handler);
    install_handler(SIGUSR1, sigusr1_handler);
    set_interval_timer(1_000);

    // Churn a pool of live blocks so signals land while the agent is
    // stamping headers, probing the index and publishing events.
    const POOL: usize = 32;
    let mut slots: [*mut u8; POOL] = [std::ptr::null_mut(); POOL];
    let start = Instant::now();
    let duration = Duration::from_secs(3);
    let mut ops = 0usize;
    let mut round = 0usize;

    while start.elapsed() < duration {
        for (i, slot) in slots.iter_mut().enumerate() {
            let size = 16 + (round + i * 7) % 240;
            unsafe {
                if slot.is_null() {
                    let p = malloc(size);
                    assert!(!p.is_null());
                    std::ptr::write_bytes(p, 0xA7, size);
                    *slot = p;
                } else if (round + i) % 3 == 0 {
                    let q = realloc(*slot, size);
                    assert!(!q.is_null());
                    assert_eq!(*q, 0xA7, "pattern must survive an interrupted realloc");
                    *slot = q;
                } else {
                    assert_eq!(**slot, 0xA7, "pattern must survive interrupted churn");
                    free(*slot);
                    *slot = std::ptr::null_mut();
                }
            }
            ops += 1;
        }
        round += 1;
        unsafe { raise(SIGUSR1) };
    }

    // Quiesce before the final accounting.
    set_interval_timer(0);

    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { free(*slot) };
            *slot = std::ptr::null_mut();
        }
    }

    let alrm = ALRM_COUNT.load(Ordering::Relaxed);
    let usr1 = USR1_COUNT.load(Ordering::Relaxed);
    println!("interposer operations: {}", ops);
    println!("timer interruptions: {}", alrm);
    println!(
        "nested malloc/touch/free cycles: {}/{}",
        NESTED_CYCLES_OK.load(Ordering::Relaxed),
        usr1
    );

    assert!(alrm > 0, "the interval timer must have fired");
    assert!(usr1 > 0, "the explicit signal must have fired");
    assert_eq!(
        SENTINEL_CORRUPTIONS.load(Ordering::Relaxed),
        0,
        "sentinel data corrupted by an interrupted operation"
    );
    assert_eq!(
        SIZE_MISMATCHES.load(Ordering::Relaxed),
        0,
        "a header reported the wrong size under interruption"
    );
    assert_eq!(
        STATS_INCOHERENT.load(Ordering::Relaxed),
        0,
        "statistics counters went incoherent under interruption"
    );

    unsafe {
        for (i, &b) in
            std::slice::from_raw_parts(sentinel, SENTINEL_SIZE).iter().enumerate()
        {
            assert_eq!(b, SENTINEL_BYTE, "sentinel byte {} corrupted", i);
        }
        if agent_present {
            assert_eq!(malloc_usable_size(sentinel), SENTINEL_SIZE);
        }
        SENTINEL.store(0, Ordering::Release);
        free(sentinel);
    }

    if let Some((allocs, frees, current)) = unsafe { agent_get_stats() } {
        println!(
            "final stats: allocs={} frees={} current={} bytes",
            allocs, frees, current
        );
        assert!(allocs >= frees, "frees can never outnumber allocations");
    }

    println!("\nTest completed without deadlock - PASS");
}
