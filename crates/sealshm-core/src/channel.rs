//! Capability channel: moves one descriptor between processes over a
//! connected Unix domain socket.
//!
//! Each handoff is a single `sendmsg(2)` carrying one placeholder byte and one
//! `SCM_RIGHTS` record. The kernel duplicates the descriptor into the
//! receiver's table as part of delivering that message, so the receiver sees
//! either both the byte and the descriptor, or neither.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::HANDOFF_MARKER;
use crate::error::{HandoffError, ProtocolViolation, Result};

/// Receive buffer size. Anything other than one byte is rejected, but the
/// buffer is larger so an oversized payload shows up as such.
const PAYLOAD_CAPACITY: usize = 64;

/// Descriptor slots reserved on receive, so extra handles are counted rather
/// than silently truncated.
const MAX_HANDLES: usize = 4;

/// A transport able to carry a capability handle to its peer.
pub trait CapabilityChannel {
    /// Send `handle` with the placeholder byte as one message.
    fn send_capability(&self, handle: BorrowedFd<'_>) -> Result<()>;

    /// Block until one handoff message arrives and return its handle.
    ///
    /// The caller owns the returned descriptor.
    fn receive_capability(&self) -> Result<OwnedFd>;
}

impl CapabilityChannel for UnixStream {
    fn send_capability(&self, handle: BorrowedFd<'_>) -> Result<()> {
        send_handle(self.as_fd(), handle)
    }

    fn receive_capability(&self) -> Result<OwnedFd> {
        receive_handle(self.as_fd())
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

pub fn send_handle(conn: BorrowedFd<'_>, handle: BorrowedFd<'_>) -> Result<()> {
    let sent = send_with_rights(conn, &[HANDOFF_MARKER], &[handle])
        .map_err(|e| HandoffError::resource("sendmsg", e))?;
    if sent != 1 {
        return Err(HandoffError::resource(
            "sendmsg",
            io::Error::new(io::ErrorKind::WriteZero, "placeholder byte was not sent"),
        ));
    }
    tracing::debug!(handle = handle.as_raw_fd(), "capability sent");
    Ok(())
}

/// `sendmsg(2)` with `payload` as data and `fds` as one `SCM_RIGHTS` record.
pub(crate) fn send_with_rights(
    conn: BorrowedFd<'_>,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let fd_bytes = (fds.len() * mem::size_of::<RawFd>()) as libc::c_uint;
    let space = if fds.is_empty() {
        0
    } else {
        unsafe { libc::CMSG_SPACE(fd_bytes) as usize }
    };
    let mut control = control_buffer(space);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        // SAFETY: the control buffer is aligned and sized by CMSG_SPACE for
        // exactly `fds.len()` descriptors.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes) as _;
            let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            for (i, fd) in fds.iter().enumerate() {
                data.add(i).write_unaligned(fd.as_raw_fd());
            }
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(conn.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// ---------------------------------------------------------------------------
// Receive
// ---------------------------------------------------------------------------

pub fn receive_handle(conn: BorrowedFd<'_>) -> Result<OwnedFd> {
    let mut payload = [0u8; PAYLOAD_CAPACITY];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    // Room for a credentials record too, so a peer with SO_PASSCRED shows up
    // as the wrong kind of ancillary data instead of a truncation.
    let space = unsafe {
        libc::CMSG_SPACE((MAX_HANDLES * mem::size_of::<RawFd>()) as libc::c_uint)
            + libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as libc::c_uint)
    } as usize;
    let mut control = control_buffer(space);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let received = loop {
        let n = unsafe { libc::recvmsg(conn.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(HandoffError::resource("recvmsg", err));
        }
    };

    // Take ownership of every delivered descriptor before validating, so
    // that a rejected message does not leak them.
    let mut handles = Vec::new();
    let mut foreign = None;
    // SAFETY: the kernel filled `control` with well-formed cmsg records and
    // updated msg_controllen to cover them.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;
            if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..data_len / mem::size_of::<RawFd>() {
                    handles.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            } else if foreign.is_none() {
                foreign = Some((level, kind));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if received == 0 {
        return Err(ProtocolViolation::Closed.into());
    }
    if received != 1 {
        return Err(ProtocolViolation::PayloadLength(received).into());
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(ProtocolViolation::Truncated.into());
    }
    if let Some((level, kind)) = foreign {
        return Err(ProtocolViolation::WrongKind { level, kind }.into());
    }

    match handles.len() {
        0 => Err(ProtocolViolation::NoHandle.into()),
        1 => {
            let handle = handles.remove(0);
            tracing::debug!(handle = handle.as_raw_fd(), "capability received");
            Ok(handle)
        }
        n => Err(ProtocolViolation::ExtraHandles(n).into()),
    }
}

/// Zeroed control buffer aligned for `cmsghdr`.
fn control_buffer(len: usize) -> Vec<u64> {
    vec![0u64; len.div_ceil(mem::size_of::<u64>())]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
