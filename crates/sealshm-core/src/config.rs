//! Handoff configuration shared by the producer and the consumer.

use std::ffi::{CStr, CString};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use crate::socket::{self, DEFAULT_SOCKET_PATH};

/// Region length used by both sides unless configured otherwise.
pub const DEFAULT_REGION_SIZE: NonZeroUsize = NonZeroUsize::new(1024).unwrap();

/// Text the producer places in front of each connection's tag.
pub const DEFAULT_MESSAGE_PREFIX: &str = "Secure zero-copy message from server";

/// Debug name given to each region (visible in `/proc/<pid>/fd`).
pub const DEFAULT_REGION_NAME: &CStr = c"sealshm region";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    /// Rendezvous socket the producer binds and the consumer connects to.
    pub socket_path: PathBuf,
    /// Exact length of every region. The consumer rejects any other length.
    pub region_size: NonZeroUsize,
    pub message_prefix: String,
    pub region_name: CString,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            region_size: DEFAULT_REGION_SIZE,
            message_prefix: DEFAULT_MESSAGE_PREFIX.to_string(),
            region_name: DEFAULT_REGION_NAME.to_owned(),
        }
    }
}

impl HandoffConfig {
    /// Configuration for the producer. Ignores `SEALSHM_SOCK`.
    pub fn for_daemon() -> Self {
        Self {
            socket_path: socket::resolve_socket_path(false),
            ..Self::default()
        }
    }

    /// Configuration for a consumer. Honours `SEALSHM_SOCK`.
    pub fn for_client() -> Self {
        Self {
            socket_path: socket::socket_path(),
            ..Self::default()
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_region_size(mut self, size: NonZeroUsize) -> Self {
        self.region_size = size;
        self
    }

    pub fn with_message_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.message_prefix = prefix.into();
        self
    }
}
