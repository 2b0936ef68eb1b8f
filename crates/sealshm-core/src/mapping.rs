//! Scoped `mmap` wrappers over memory-region descriptors.

use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

fn map(
    fd: BorrowedFd<'_>,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            flags,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap returned a null address"))
}

/// # Safety
///
/// `ptr` and `len` must describe a live mapping returned by [`map`] that has
/// not been unmapped yet, and no references into it may outlive this call.
unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Attempt a mapping and immediately release it.
///
/// Returns `Ok(())` if the kernel allowed the mapping.
pub(crate) fn try_map(
    fd: BorrowedFd<'_>,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
) -> io::Result<()> {
    let ptr = map(fd, len, prot, flags)?;
    unsafe { unmap(ptr, len) }
}

/// A shared writable mapping that only exists for the duration of
/// [`WritableMapping::with`].
///
/// The slice handed to the closure cannot outlive it, so once `with` returns
/// the process holds no writable view of the region.
pub(crate) struct WritableMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl WritableMapping {
    pub(crate) fn with<R>(
        fd: BorrowedFd<'_>,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> io::Result<R> {
        let mapping = Self {
            ptr: map(fd, len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED)?,
            len,
        };
        let out = f(unsafe {
            std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), mapping.len)
        });
        mapping.unmap()?;
        Ok(out)
    }

    fn unmap(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        unsafe { unmap(this.ptr, this.len) }
    }
}

impl Drop for WritableMapping {
    // Only reached when the closure panics.
    fn drop(&mut self) {
        let _ = unsafe { unmap(self.ptr, self.len) };
    }
}

/// A read-only shared mapping of a verified region.
pub(crate) struct ReadOnlyMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl ReadOnlyMapping {
    pub(crate) fn new(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        let ptr = map(fd, len, libc::PROT_READ, libc::MAP_SHARED)?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ReadOnlyMapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { unmap(self.ptr, self.len) } {
            tracing::warn!("munmap of read-only region failed: {e}");
        }
    }
}

impl std::fmt::Debug for ReadOnlyMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyMapping").field("len", &self.len).finish()
    }
}
