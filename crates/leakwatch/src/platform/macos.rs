use super::SharedRegion;
use core::ffi::CStr;
use core::ptr;

pub fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { core::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[inline]
pub fn thread_handle() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/// shm_open + ftruncate + mmap(MAP_SHARED).
///
/// macOS rejects ftruncate on an already-sized region, so a failure there
/// is ignored when the region already has the right length.
///
/// # Safety
/// `len` must be non-zero.
pub unsafe fn map_shared_region(name: &CStr, len: usize) -> Option<SharedRegion> {
    let fd = libc::shm_open(
        name.as_ptr(),
        libc::O_CREAT | libc::O_RDWR,
        0o666 as libc::mode_t,
    );
    if fd < 0 {
        return None;
    }
    if libc::ftruncate(fd, len as libc::off_t) != 0 {
        let mut st: libc::stat = core::mem::zeroed();
        if libc::fstat(fd, &mut st) != 0 || (st.st_size as usize) < len {
            libc::close(fd);
            return None;
        }
    }
    let p = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );
    if p == libc::MAP_FAILED {
        libc::close(fd);
        return None;
    }
    Some(SharedRegion {
        ptr: p as *mut u8,
        fd,
        len,
    })
}

/// # Safety
/// The mapping must not be used afterwards.
pub unsafe fn unmap_shared_region(region: &SharedRegion) {
    libc::munmap(region.ptr as *mut libc::c_void, region.len);
    libc::close(region.fd);
}

/// # Safety
/// Existing mappings in other processes survive the unlink.
pub unsafe fn unlink_region(name: &CStr) {
    libc::shm_unlink(name.as_ptr());
}
