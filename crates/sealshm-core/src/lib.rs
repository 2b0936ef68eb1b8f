//! Sealed shared-memory handoff between local processes.
//!
//! A producer builds an anonymous memory region, seals it against shrinking,
//! writing and further sealing, then passes the region's descriptor (not its
//! contents) over a Unix domain socket. The consumer refuses to read the
//! region until it has checked both the declared seal set and the behaviour
//! the seals promise.

pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod listener;
mod mapping;
pub mod peer;
pub mod region;
pub mod seal;
pub mod socket;

pub use channel::CapabilityChannel;
pub use config::HandoffConfig;
pub use consumer::{Consumer, VerifiedRegion};
pub use error::{HandoffError, ProtocolViolation, Result, TrustViolation};
pub use listener::{Dispatcher, Listener};
pub use region::{RegionFactory, SealedRegion};
pub use seal::{Seal, SealSet};

/// Placeholder byte carried alongside every transferred descriptor.
///
/// The kernel only delivers ancillary data together with at least one byte of
/// ordinary payload. Its value is not interpreted by the receiver.
pub const HANDOFF_MARKER: u8 = b'A';
