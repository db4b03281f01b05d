use core::ffi::CStr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const DEFAULT_STALENESS_NS: u64 = 3_000_000_000;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SHM_NAME: &[u8] = b"/ml_advanced_leak_detection\0";

const SHM_NAME_MAX: usize = 64;

/// Cached config values (read once at init, never allocate).
static STALENESS_NS: AtomicU64 = AtomicU64::new(DEFAULT_STALENESS_NS);
static SCAN_INTERVAL_MS: AtomicU64 = AtomicU64::new(DEFAULT_SCAN_INTERVAL_MS);
static mut SHM_NAME_BUF: [u8; SHM_NAME_MAX] = [0; SHM_NAME_MAX];
static SHM_NAME_LEN: AtomicUsize = AtomicUsize::new(0);

/// Read configuration from environment variables.
///
/// # Safety
/// Calls libc::getenv, so must run from single-threaded context (init),
/// before any allocations on other threads.
pub unsafe fn read_config() {
    if let Some(val) = getenv_u64(b"LEAKWATCH_STALENESS_NS\0") {
        STALENESS_NS.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_u64(b"LEAKWATCH_SCAN_INTERVAL_MS\0") {
        SCAN_INTERVAL_MS.store(val, Ordering::Relaxed);
    }
    copy_shm_name(b"LEAKWATCH_SHM_NAME\0");
}

/// Check if the agent is disabled via env var (pure passthrough mode).
///
/// # Safety
/// Calls libc::getenv which is not thread-safe, so must be called during init.
pub unsafe fn is_disabled() -> bool {
    let key = b"LEAKWATCH_DISABLE\0".as_ptr() as *const libc::c_char;
    !libc::getenv(key).is_null()
}

pub fn staleness_ns() -> u64 {
    STALENESS_NS.load(Ordering::Relaxed)
}

/// Scanner period in milliseconds; 0 disables the background scanner.
pub fn scan_interval_ms() -> u64 {
    SCAN_INTERVAL_MS.load(Ordering::Relaxed)
}

/// The shared-memory region name, NUL-terminated.
pub fn shm_name() -> &'static CStr {
    let len = SHM_NAME_LEN.load(Ordering::Acquire);
    if len == 0 {
        return unsafe { CStr::from_bytes_with_nul_unchecked(DEFAULT_SHM_NAME) };
    }
    unsafe {
        let base = core::ptr::addr_of!(SHM_NAME_BUF) as *const u8;
        CStr::from_bytes_with_nul_unchecked(core::slice::from_raw_parts(base, len))
    }
}

/// Parse an environment variable as a u64.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_u64(key: &[u8]) -> Option<u64> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: u64 = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as u64)?;
        ptr = ptr.add(1);
    }
    Some(result)
}

/// Copy a region-name override into the fixed buffer, NUL-terminated.
/// Oversized or empty values are ignored.
///
/// # Safety
/// Calls libc::getenv; init-time only.
unsafe fn copy_shm_name(key: &[u8]) {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return;
    }
    let mut n = 0usize;
    while *(val.add(n) as *const u8) != 0 {
        n += 1;
    }
    if n == 0 || n + 1 > SHM_NAME_MAX {
        return;
    }
    let dst = core::ptr::addr_of_mut!(SHM_NAME_BUF) as *mut u8;
    core::ptr::copy_nonoverlapping(val as *const u8, dst, n);
    *dst.add(n) = 0;
    SHM_NAME_LEN.store(n + 1, Ordering::Release);
}
