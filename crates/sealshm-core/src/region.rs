//! Memory region factory.
//!
//! A region moves through a fixed sequence of phases, each a distinct type
//! exposing only the step that is valid next:
//!
//! ```text
//! Sealable -> SizedRegion -> WrittenRegion -> WriteSealedRegion -> SealedRegion
//! ```
//!
//! The shrink seal goes on as soon as the length is set. Content is written
//! through a mapping that only lives inside a closure, so by the time
//! [`WrittenRegion::seal_writes`] is callable no writable mapping can remain.
//! The lock seal comes last because it blocks every later seal.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::channel::CapabilityChannel;
use crate::config::HandoffConfig;
use crate::error::{HandoffError, Result};
use crate::mapping::WritableMapping;
use crate::seal::{self, Seal, SealSet};

/// Create an anonymous memory object via `memfd_create(2)`.
///
/// Sealing support can only be requested here; it cannot be added later.
pub(crate) fn anonymous_memory(name: &CStr, allow_sealing: bool) -> Result<File> {
    let mut flags = libc::MFD_CLOEXEC;
    if allow_sealing {
        flags |= libc::MFD_ALLOW_SEALING;
    }
    let fd = unsafe { libc::memfd_create(name.as_ptr(), flags) };
    if fd < 0 {
        return Err(HandoffError::last_os_error("memfd_create"));
    }
    // SAFETY: memfd_create returned a fresh descriptor we exclusively own.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// A freshly created, empty, sealable region.
#[derive(Debug)]
pub struct Sealable {
    file: File,
}

impl Sealable {
    pub fn create(name: &CStr) -> Result<Self> {
        Ok(Self {
            file: anonymous_memory(name, true)?,
        })
    }

    /// Fix the region length and seal it against shrinking.
    pub fn size(self, len: NonZeroUsize) -> Result<SizedRegion> {
        self.file
            .set_len(len.get() as u64)
            .map_err(|e| HandoffError::resource("ftruncate", e))?;
        seal::apply(self.file.as_fd(), Seal::Shrink)?;
        Ok(SizedRegion {
            file: self.file,
            len,
        })
    }
}

/// A region with a fixed length and no content yet.
#[derive(Debug)]
pub struct SizedRegion {
    file: File,
    len: NonZeroUsize,
}

impl SizedRegion {
    /// Fill the region through a shared writable mapping.
    ///
    /// The mapping is released before this returns, whether or not `fill`
    /// completes.
    pub fn write(self, fill: impl FnOnce(&mut [u8])) -> Result<WrittenRegion> {
        WritableMapping::with(self.file.as_fd(), self.len.get(), fill)
            .map_err(|e| HandoffError::resource("mmap(PROT_WRITE, MAP_SHARED)", e))?;
        Ok(WrittenRegion {
            file: self.file,
            len: self.len,
        })
    }
}

/// A region whose content is final but not yet write-protected.
#[derive(Debug)]
pub struct WrittenRegion {
    file: File,
    len: NonZeroUsize,
}

impl WrittenRegion {
    pub fn seal_writes(self) -> Result<WriteSealedRegion> {
        seal::apply(self.file.as_fd(), Seal::Write)?;
        Ok(WriteSealedRegion {
            file: self.file,
            len: self.len,
        })
    }
}

/// A write-protected region whose seal set can still grow.
#[derive(Debug)]
pub struct WriteSealedRegion {
    file: File,
    len: NonZeroUsize,
}

impl WriteSealedRegion {
    /// Freeze the seal set.
    pub fn lock(self) -> Result<SealedRegion> {
        seal::apply(self.file.as_fd(), Seal::Lock)?;
        Ok(SealedRegion {
            file: self.file,
            len: self.len,
        })
    }
}

/// A fully sealed region, ready to be handed off.
///
/// There is no way to write to it. Handing it off consumes it, which closes
/// the producer's descriptor once the message is on its way.
#[derive(Debug)]
pub struct SealedRegion {
    file: File,
    len: NonZeroUsize,
}

impl SealedRegion {
    pub fn len(&self) -> NonZeroUsize {
        self.len
    }

    pub fn seals(&self) -> Result<SealSet> {
        seal::query(self.file.as_fd())
    }

    /// Send the region's descriptor over `channel` and release it locally.
    pub fn hand_off<C: CapabilityChannel + ?Sized>(self, channel: &C) -> Result<()> {
        channel.send_capability(self.file.as_fd())
    }
}

impl AsFd for SealedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Build a sealed region of `size` bytes holding `content` followed by a NUL.
///
/// Any failure drops the half-built region, so callers never see a region
/// that is only partly sealed.
pub fn create_region(name: &CStr, size: NonZeroUsize, content: &[u8]) -> Result<SealedRegion> {
    if content.len() >= size.get() {
        return Err(HandoffError::Policy(format!(
            "content of {} bytes does not fit a {size}-byte region with its terminator",
            content.len()
        )));
    }

    Sealable::create(name)?
        .size(size)?
        .write(|buf| {
            buf[..content.len()].copy_from_slice(content);
            buf[content.len()] = 0;
        })?
        .seal_writes()?
        .lock()
}

/// Creates sealed regions with the configured name and size.
#[derive(Debug, Clone)]
pub struct RegionFactory {
    name: CString,
    size: NonZeroUsize,
}

impl RegionFactory {
    pub fn new(config: &HandoffConfig) -> Self {
        Self {
            name: config.region_name.clone(),
            size: config.region_size,
        }
    }

    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    pub fn create(&self, content: &[u8]) -> Result<SealedRegion> {
        create_region(&self.name, self.size, content)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
