use core::ffi::CStr;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// A mapped POSIX shared-memory region, kept around for teardown.
pub struct SharedRegion {
    pub ptr: *mut u8,
    pub fd: libc::c_int,
    pub len: usize,
}

unsafe impl Send for SharedRegion {}

/// Monotonic timestamp in nanoseconds. Epoch unspecified, stable for the
/// process lifetime.
#[inline]
pub fn monotonic_ns() -> u64 {
    sys::monotonic_ns()
}

/// A 32-bit fingerprint of the calling thread, stable for the thread's life.
///
/// Derived from `pthread_self` rather than gettid: reading the thread
/// control block needs no syscall and no lazy TLS initialization, so it is
/// safe at any depth inside the interposer.
#[inline]
pub fn thread_id() -> u32 {
    crate::util::splitmix64(sys::thread_handle() as u64) as u32
}

/// Create (if absent), size and map the named shared-memory region
/// read-write shared. Returns None on any failure.
///
/// # Safety
/// `len` must be non-zero.
pub unsafe fn map_shared_region(name: &CStr, len: usize) -> Option<SharedRegion> {
    sys::map_shared_region(name, len)
}

/// Unmap and close a region previously returned by `map_shared_region`.
///
/// # Safety
/// The region must not be accessed afterwards.
pub unsafe fn unmap_shared_region(region: &SharedRegion) {
    sys::unmap_shared_region(region);
}

/// Remove the region name from the namespace.
///
/// # Safety
/// Callers in other processes keep their mappings; only the name goes away.
pub unsafe fn unlink_region(name: &CStr) {
    sys::unlink_region(name);
}
