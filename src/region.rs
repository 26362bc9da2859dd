//! OS-backed shared memory extents.
//!
//! A `Region` is a fixed-byte segment of memory visible to every
//! participant descended from the process that created it. This layer
//! only knows how to create, destroy, attach and detach such segments; it
//! has no opinion about what lives inside one. Backed by POSIX
//! `shm_open`/`mmap` rather than System V `shmget`/`shmat`: POSIX shared
//! memory objects are reference-counted by the kernel through the open
//! file descriptor, which composes better with this crate's own region
//! bookkeeping than a `shmid` would.

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ProcshareError, Result};
use crate::util::address::Address;

const NAME_CAP: usize = 64;

/// A POD descriptor for a region, storable directly in shared memory
/// (it lives inside `Globals::regtable`, which every participant reads).
#[derive(Copy, Clone)]
#[repr(C)]
pub struct RegionHandle {
    name: [u8; NAME_CAP],
    name_len: u8,
    pub size: usize,
}

impl RegionHandle {
    pub const NULL: RegionHandle = RegionHandle {
        name: [0; NAME_CAP],
        name_len: 0,
        size: 0,
    };

    pub fn is_null(&self) -> bool {
        self.name_len == 0
    }

    fn name_str(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    fn name_cstring(&self) -> CString {
        CString::new(self.name_str()).expect("region names never contain NUL")
    }
}

static REGION_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_name() -> CString {
    let n = REGION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let s = format!("/procshare-{}-{}", std::process::id(), n);
    debug_assert!(s.len() < NAME_CAP);
    CString::new(s).unwrap()
}

/// Creates a new shared memory segment of at least `size` bytes. Returns
/// the handle and the actual (page-rounded) size.
pub fn region_new(size: usize) -> Result<RegionHandle> {
    let name = next_name();
    let page_size = page_size();
    let rounded = (size + page_size - 1) & !(page_size - 1);

    unsafe {
        let fd = libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        );
        if fd < 0 {
            return Err(ProcshareError::RegionCreationFailed(io::Error::last_os_error()));
        }
        if libc::ftruncate(fd, rounded as libc::off_t) != 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            let _ = libc::shm_unlink(name.as_ptr());
            return Err(ProcshareError::RegionCreationFailed(e));
        }
        libc::close(fd);
    }

    let mut handle = RegionHandle {
        name: [0; NAME_CAP],
        name_len: 0,
        size: rounded,
    };
    let bytes = name.as_bytes();
    handle.name[..bytes.len()].copy_from_slice(bytes);
    handle.name_len = bytes.len() as u8;
    log::debug!("region_new: created {} ({} bytes)", handle.name_str(), rounded);
    Ok(handle)
}

/// Destroys a region. `shm_unlink` is idempotent in effect: a region
/// already unlinked by a peer (e.g. the last participant racing cleanup
/// against a sibling) is tolerated rather than treated as an error.
pub fn region_destroy(handle: &RegionHandle) {
    if handle.is_null() {
        return;
    }
    let name = handle.name_cstring();
    unsafe {
        if libc::shm_unlink(name.as_ptr()) != 0 {
            log::debug!(
                "region_destroy: shm_unlink({:?}) failed (already gone?): {}",
                name,
                io::Error::last_os_error()
            );
        }
    }
}

/// Maps a region into this participant's address space.
pub fn region_attach(handle: &RegionHandle) -> Result<Address> {
    let name = handle.name_cstring();
    unsafe {
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600);
        if fd < 0 {
            return Err(ProcshareError::Os(io::Error::last_os_error()));
        }
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            handle.size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        if ptr == libc::MAP_FAILED {
            return Err(ProcshareError::Os(io::Error::last_os_error()));
        }
        Ok(Address::from_mut_ptr(ptr))
    }
}

/// Unmaps a previously attached region from this participant's address
/// space.
pub fn region_detach(addr: Address, size: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(addr.to_mut_ptr::<libc::c_void>(), size) };
    if rc != 0 {
        return Err(ProcshareError::Os(io::Error::last_os_error()));
    }
    Ok(())
}

fn page_size() -> usize {
    let r = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if r <= 0 {
        4096
    } else {
        r as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_roundtrip() {
        let handle = region_new(1024).expect("region_new");
        assert!(handle.size >= 1024);
        let addr = region_attach(&handle).expect("region_attach");
        unsafe {
            *addr.to_mut_ptr::<u32>() = 0xDEADBEEF;
            assert_eq!(*addr.to_ptr::<u32>(), 0xDEADBEEF);
        }
        region_detach(addr, handle.size).expect("region_detach");
        region_destroy(&handle);
    }
}
