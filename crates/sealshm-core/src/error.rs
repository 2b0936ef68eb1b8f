use std::io;

use crate::seal::SealSet;

/// Errors raised anywhere in the handoff protocol.
///
/// None of these are retried. The caller aborts the current handoff and
/// reports the message.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("{context}: {source}")]
    Resource {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("malformed handoff message: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("seal guarantees do not hold: {0}")]
    TrustViolation(#[from] TrustViolation),

    #[error("sealing policy misuse: {0}")]
    Policy(String),
}

impl HandoffError {
    /// Wrap an OS error with the name of the call that failed.
    pub fn resource(context: &'static str, source: io::Error) -> Self {
        Self::Resource { context, source }
    }

    /// Capture `errno` for a failed libc call.
    pub(crate) fn last_os_error(context: &'static str) -> Self {
        Self::resource(context, io::Error::last_os_error())
    }

    /// Stable code for structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Resource { .. } => "resource_error",
            Self::Protocol(_) => "protocol_error",
            Self::TrustViolation(_) => "trust_violation",
            Self::Policy(_) => "policy_error",
        }
    }
}

/// Ways a peer can get the handoff message wrong.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("peer closed the connection before sending a handle")]
    Closed,

    #[error("expected a 1-byte placeholder payload, received {0} bytes")]
    PayloadLength(usize),

    #[error("message carried no handle")]
    NoHandle,

    #[error("unexpected ancillary record (level {level}, type {kind})")]
    WrongKind { level: i32, kind: i32 },

    #[error("message carried {0} handles, expected exactly one")]
    ExtraHandles(usize),

    #[error("ancillary data was truncated by the kernel")]
    Truncated,

    #[error("region content is not NUL-terminated")]
    UnterminatedContent,
}

/// A guarantee the producer promised but the received region does not keep.
#[derive(Debug, thiserror::Error)]
pub enum TrustViolation {
    #[error("handle does not refer to a sealable memory region")]
    NotSealable,

    #[error("required seals missing: {0}")]
    MissingSeals(SealSet),

    #[error("region is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("region could be shrunk despite the shrink seal")]
    ShrinkAllowed,

    #[error("a new seal could be added despite the seal lock")]
    SealAddAllowed,

    #[error("adding a seal failed with an unexpected error: {0}")]
    UnexpectedSealError(io::Error),

    #[error("region could be mapped writable-shared despite the write seal")]
    WritableMapAllowed,
}

pub type Result<T> = std::result::Result<T, HandoffError>;
