//! Capability consumer: receives a region and refuses to read it until the
//! producer's guarantees have been checked.
//!
//! Verification has two halves. First the declared seal set must contain
//! every seal in [`SealSet::REQUIRED`]. Then each guarantee is exercised
//! directly: shrinking, adding a seal, and mapping writable-shared must all
//! be refused by the kernel. Only then is the region mapped read-only.

use std::ffi::CStr;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tracing::debug;

use crate::channel::CapabilityChannel;
use crate::config::HandoffConfig;
use crate::error::{HandoffError, ProtocolViolation, Result, TrustViolation};
use crate::mapping::{self, ReadOnlyMapping};
use crate::seal::{self, SealSet};

#[derive(Debug, Clone)]
pub struct Consumer {
    expected_size: NonZeroUsize,
}

impl Consumer {
    pub fn new(config: &HandoffConfig) -> Self {
        Self {
            expected_size: config.region_size,
        }
    }

    /// Receive one capability from `channel` and verify it.
    pub fn receive<C: CapabilityChannel + ?Sized>(&self, channel: &C) -> Result<VerifiedRegion> {
        let handle = channel.receive_capability()?;
        self.verify(handle)
    }

    /// Verify a region handle and map it read-only.
    pub fn verify(&self, handle: OwnedFd) -> Result<VerifiedRegion> {
        let file = File::from(handle);

        let seals = match seal::query(file.as_fd()) {
            Ok(seals) => seals,
            Err(HandoffError::Policy(_)) => return Err(TrustViolation::NotSealable.into()),
            Err(e) => return Err(e),
        };
        let missing = SealSet::REQUIRED.difference(seals);
        if !missing.is_empty() {
            return Err(TrustViolation::MissingSeals(missing).into());
        }
        debug!(%seals, "declared seals present");

        let actual = file
            .metadata()
            .map_err(|e| HandoffError::resource("fstat", e))?
            .len();
        let expected = self.expected_size.get() as u64;
        if actual != expected {
            return Err(TrustViolation::SizeMismatch { expected, actual }.into());
        }

        check_shrink(&file)?;
        check_seal_lock(&file)?;
        check_writable_mapping(&file, self.expected_size.get())?;
        debug!("seal guarantees checked");

        let mapping = ReadOnlyMapping::new(file.as_fd(), self.expected_size.get())
            .map_err(|e| HandoffError::resource("mmap(PROT_READ)", e))?;

        Ok(VerifiedRegion {
            mapping,
            file,
            seals,
        })
    }
}

fn check_shrink(file: &File) -> Result<()> {
    match file.set_len(0) {
        Ok(()) => Err(TrustViolation::ShrinkAllowed.into()),
        Err(_) => Ok(()),
    }
}

fn check_seal_lock(file: &File) -> Result<()> {
    match seal::add_seals(file.as_fd(), SealSet::GROW) {
        Ok(()) => Err(TrustViolation::SealAddAllowed.into()),
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(()),
        Err(e) => Err(TrustViolation::UnexpectedSealError(e).into()),
    }
}

fn check_writable_mapping(file: &File, len: usize) -> Result<()> {
    match mapping::try_map(
        file.as_fd(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
    ) {
        Ok(()) => Err(TrustViolation::WritableMapAllowed.into()),
        Err(_) => Ok(()),
    }
}

/// A region that passed verification, mapped read-only.
///
/// Dropping it unmaps the region and then closes the handle.
#[derive(Debug)]
pub struct VerifiedRegion {
    mapping: ReadOnlyMapping,
    file: File,
    seals: SealSet,
}

impl VerifiedRegion {
    pub fn as_bytes(&self) -> &[u8] {
        self.mapping.as_bytes()
    }

    pub fn seals(&self) -> SealSet {
        self.seals
    }

    /// The NUL-terminated message at offset 0.
    pub fn message(&self) -> Result<&CStr> {
        CStr::from_bytes_until_nul(self.as_bytes())
            .map_err(|_| ProtocolViolation::UnterminatedContent.into())
    }
}

impl AsFd for VerifiedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileExt;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::region::{Sealable, anonymous_memory, create_region};

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn consumer() -> Consumer {
        Consumer::new(&HandoffConfig::default())
    }

    #[test]
    fn sealed_region_is_verified_and_read() {
        let (producer, conn) = UnixStream::pair().unwrap();
        let region = create_region(c"hello", size(1024), b"hello").unwrap();
        region.hand_off(&producer).unwrap();

        let verified = consumer().receive(&conn).unwrap();
        assert_eq!(verified.seals(), SealSet::REQUIRED);
        assert_eq!(verified.message().unwrap(), c"hello");
        assert_eq!(verified.as_bytes().len(), 1024);
        assert_eq!(&verified.as_bytes()[..6], b"hello\0");
    }

    #[test]
    fn content_round_trips_byte_for_byte() {
        let content = b"Secure zero-copy message from server: connection 7";
        let (producer, conn) = UnixStream::pair().unwrap();
        create_region(c"round-trip", size(1024), content)
            .unwrap()
            .hand_off(&producer)
            .unwrap();

        let verified = consumer().receive(&conn).unwrap();
        let bytes = verified.as_bytes();
        assert_eq!(&bytes[..content.len()], content);
        assert_eq!(bytes[content.len()], 0);
        assert_eq!(verified.message().unwrap().to_bytes(), content);
    }

    #[test]
    fn unsealed_region_is_trust_violation() {
        let (producer, conn) = UnixStream::pair().unwrap();
        let tampered = anonymous_memory(c"tampered", true).unwrap();
        tampered.set_len(1024).unwrap();
        tampered.write_at(b"hello\0", 0).unwrap();
        producer.send_capability(tampered.as_fd()).unwrap();

        let err = consumer().receive(&conn).unwrap_err();
        match err {
            HandoffError::TrustViolation(TrustViolation::MissingSeals(missing)) => {
                assert_eq!(missing, SealSet::REQUIRED);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unlocked_seal_set_is_trust_violation() {
        let region = anonymous_memory(c"unlocked", true).unwrap();
        region.set_len(1024).unwrap();
        seal::add_seals(region.as_fd(), SealSet::SHRINK | SealSet::WRITE).unwrap();

        let err = consumer().verify(region.into()).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::TrustViolation(TrustViolation::MissingSeals(m)) if m == SealSet::LOCK
        ));
    }

    #[test]
    fn non_memory_handle_is_trust_violation() {
        let (a, _b) = UnixStream::pair().unwrap();
        let err = consumer().verify(OwnedFd::from(a)).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::TrustViolation(TrustViolation::NotSealable)
        ));
    }

    #[test]
    fn unexpected_length_is_trust_violation() {
        let region = create_region(c"small", size(512), b"small").unwrap();
        let handle = region.as_fd().try_clone_to_owned().unwrap();

        let err = consumer().verify(handle).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::TrustViolation(TrustViolation::SizeMismatch {
                expected: 1024,
                actual: 512
            })
        ));
    }

    #[test]
    fn checks_leave_region_intact() {
        let region = create_region(c"checked", size(1024), b"intact").unwrap();
        let handle = region.as_fd().try_clone_to_owned().unwrap();

        let verified = consumer().verify(handle).unwrap();
        assert_eq!(region.seals().unwrap(), SealSet::REQUIRED);
        assert_eq!(verified.message().unwrap(), c"intact");
    }

    fn unsealed_memory(name: &CStr) -> File {
        let file = anonymous_memory(name, true).unwrap();
        file.set_len(1024).unwrap();
        file
    }

    #[test]
    fn shrinkable_region_fails_shrink_check() {
        let file = unsealed_memory(c"shrinkable");
        assert!(matches!(
            check_shrink(&file).unwrap_err(),
            HandoffError::TrustViolation(TrustViolation::ShrinkAllowed)
        ));
        assert_eq!(file.metadata().unwrap().len(), 0);
    }

    #[test]
    fn unlocked_region_fails_seal_lock_check() {
        let file = unsealed_memory(c"unlocked-seals");
        assert!(matches!(
            check_seal_lock(&file).unwrap_err(),
            HandoffError::TrustViolation(TrustViolation::SealAddAllowed)
        ));
        assert_eq!(seal::query(file.as_fd()).unwrap(), SealSet::GROW);
    }

    #[test]
    fn seal_lock_check_on_socket_reports_unexpected_error() {
        let (a, _b) = UnixStream::pair().unwrap();
        let file = File::from(OwnedFd::from(a));
        match check_seal_lock(&file).unwrap_err() {
            HandoffError::TrustViolation(TrustViolation::UnexpectedSealError(e)) => {
                assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn writable_region_fails_mapping_check() {
        let file = unsealed_memory(c"writable");
        assert!(matches!(
            check_writable_mapping(&file, 1024).unwrap_err(),
            HandoffError::TrustViolation(TrustViolation::WritableMapAllowed)
        ));
    }

    #[test]
    fn sealed_region_passes_every_check() {
        let region = create_region(c"checked", size(1024), b"ok").unwrap();
        let file = File::from(region.as_fd().try_clone_to_owned().unwrap());
        check_shrink(&file).unwrap();
        check_seal_lock(&file).unwrap();
        check_writable_mapping(&file, 1024).unwrap();
    }

    #[test]
    fn verified_region_exposes_its_handle() {
        let region = create_region(c"exposed", size(1024), b"handle").unwrap();
        let handle = region.as_fd().try_clone_to_owned().unwrap();

        let verified = consumer().verify(handle).unwrap();
        assert_eq!(seal::query(verified.as_fd()).unwrap(), SealSet::REQUIRED);
    }

    #[test]
    fn unterminated_content_is_rejected() {
        let region = Sealable::create(c"unterminated")
            .unwrap()
            .size(size(16))
            .unwrap()
            .write(|buf| buf.fill(b'x'))
            .unwrap()
            .seal_writes()
            .unwrap()
            .lock()
            .unwrap();
        let handle = region.as_fd().try_clone_to_owned().unwrap();

        let config = HandoffConfig::default().with_region_size(size(16));
        let verified = Consumer::new(&config).verify(handle).unwrap();
        assert!(matches!(
            verified.message().unwrap_err(),
            HandoffError::Protocol(ProtocolViolation::UnterminatedContent)
        ));
    }
}
