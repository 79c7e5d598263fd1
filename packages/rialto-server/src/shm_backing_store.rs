//! Server-owned shared-memory backing store handed out via `GetSharedMemory`
//! (§4.4, §6).
//!
//! One `memfd_create`d region per server process; each accepted connection
//! receives a `dup`'d fd over `SCM_RIGHTS`, so a guest closing its own copy
//! on teardown never affects the region for any other guest. Grounded on
//! `examples/imbhargav5-unbound.computer/apps/daemon/crates/daemon-stream/src/unix/mod.rs`'s
//! direct-`libc` shared-memory allocation (`shm_open`+`ftruncate`+`mmap`),
//! adapted to `memfd_create`: this fd only ever needs to cross `SCM_RIGHTS`
//! to a child process the parent already spawned and trusts, so there's no
//! need for a named, independently-discoverable `/dev/shm` path the way that
//! reference's same-host producer/consumer pair requires.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use rialto_common::error::{RialtoError, RialtoResult};

pub struct ShmBackingStore {
    fd: RawFd,
    size: u32,
}

impl ShmBackingStore {
    /// Allocates and sizes the region. `size` should be large enough to hold
    /// every source's partition the configured `max_playbacks` could need
    /// concurrently; sizing policy beyond the per-partition minimum in §6 is
    /// left to the embedding process.
    pub fn new(size: u32) -> RialtoResult<Self> {
        let name = CString::new("rialto-shm").expect("static name has no interior NUL");
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        if fd < 0 {
            return Err(RialtoError::Resource(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(RialtoError::Resource(format!("ftruncate failed: {err}")));
        }
        Ok(Self { fd, size })
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns a fresh fd referring to the same backing region, suitable for
    /// handing to one guest connection via `SCM_RIGHTS`.
    pub fn dup_fd(&self) -> RialtoResult<RawFd> {
        let dup = unsafe { libc::dup(self.fd) };
        if dup < 0 {
            return Err(RialtoError::Resource(format!(
                "dup failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(dup)
    }
}

impl Drop for ShmBackingStore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_a_region_of_the_requested_size_and_dups_are_independent() {
        let store = ShmBackingStore::new(65536).unwrap();
        assert_eq!(store.size(), 65536);

        let a = store.dup_fd().unwrap();
        let b = store.dup_fd().unwrap();
        assert_ne!(a, b);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
        // Closing both dups must not affect the store's own fd.
        assert!(store.dup_fd().is_ok());
    }
}
