//! Seal policy: which immutability guarantees a region carries, and the
//! rules for adding more.
//!
//! Seals only ever accumulate. Once [`SealSet::LOCK`] is present the set is
//! frozen and every further addition is refused by the kernel.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::error::{HandoffError, Result};

bitflags::bitflags! {
    /// Seals applied to an anonymous memory region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SealSet: u32 {
        /// The region may not get smaller (`F_SEAL_SHRINK`).
        const SHRINK = libc::F_SEAL_SHRINK as u32;
        /// The region may not get larger (`F_SEAL_GROW`).
        const GROW = libc::F_SEAL_GROW as u32;
        /// The content may not be modified (`F_SEAL_WRITE`).
        const WRITE = libc::F_SEAL_WRITE as u32;
        /// The seal set itself may not change (`F_SEAL_SEAL`).
        const LOCK = libc::F_SEAL_SEAL as u32;
    }
}

impl SealSet {
    /// Seals a consumer insists on before trusting a region.
    pub const REQUIRED: Self = Self::SHRINK.union(Self::WRITE).union(Self::LOCK);
}

impl fmt::Display for SealSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// A single seal, as requested by callers of [`apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Seal {
    Shrink,
    Grow,
    Write,
    Lock,
}

impl Seal {
    pub const fn flag(self) -> SealSet {
        match self {
            Seal::Shrink => SealSet::SHRINK,
            Seal::Grow => SealSet::GROW,
            Seal::Write => SealSet::WRITE,
            Seal::Lock => SealSet::LOCK,
        }
    }
}

impl fmt::Display for Seal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.flag(), f)
    }
}

// ---------------------------------------------------------------------------
// Pure policy
// ---------------------------------------------------------------------------

/// Returns `true` if `seal` would change `current` and is still allowed to.
pub fn can_add(seal: Seal, current: SealSet) -> bool {
    !current.contains(SealSet::LOCK) && !current.contains(seal.flag())
}

/// Compute the seal set after requesting `seal` on a region sealed with `current`.
///
/// Requesting a seal that is already present is a no-op, even on a locked
/// set. Requesting a new seal on a locked set is a policy error.
pub fn transition(current: SealSet, seal: Seal) -> Result<SealSet> {
    if current.contains(seal.flag()) {
        return Ok(current);
    }
    if current.contains(SealSet::LOCK) {
        return Err(HandoffError::Policy(format!(
            "cannot add {seal}: seal set is locked ({current})"
        )));
    }
    Ok(current | seal.flag())
}

// ---------------------------------------------------------------------------
// Kernel-backed operations
// ---------------------------------------------------------------------------

/// Read the seals currently applied to `fd`.
pub fn query(fd: BorrowedFd<'_>) -> Result<SealSet> {
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GET_SEALS) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) {
            return Err(HandoffError::Policy(
                "descriptor does not refer to a sealable memory region".into(),
            ));
        }
        return Err(HandoffError::resource("fcntl(F_GET_SEALS)", err));
    }
    Ok(SealSet::from_bits_truncate(rc as u32))
}

/// Apply `seal` to `fd` and return the resulting seal set.
///
/// A seal that is already present is left alone. A region created without
/// sealing support reports itself as locked, so sealing it is a policy error
/// rather than a runtime failure.
pub fn apply(fd: BorrowedFd<'_>, seal: Seal) -> Result<SealSet> {
    let current = query(fd)?;
    let next = transition(current, seal)?;
    if next == current {
        return Ok(current);
    }

    if let Err(err) = add_seals(fd, seal.flag()) {
        return Err(match err.raw_os_error() {
            Some(libc::EPERM) => {
                HandoffError::Policy(format!("kernel refused to add {seal}: {err}"))
            }
            Some(libc::EBUSY) => HandoffError::Policy(format!(
                "cannot add {seal} while a writable mapping is open"
            )),
            _ => HandoffError::resource("fcntl(F_ADD_SEALS)", err),
        });
    }

    tracing::debug!(fd = fd.as_raw_fd(), %seal, seals = %next, "seal applied");
    Ok(next)
}

/// Issue `F_ADD_SEALS` without consulting the policy first.
pub(crate) fn add_seals(fd: BorrowedFd<'_>, seals: SealSet) -> io::Result<()> {
    let rc = unsafe {
        libc::fcntl(
            fd.as_raw_fd(),
            libc::F_ADD_SEALS,
            seals.bits() as libc::c_int,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
