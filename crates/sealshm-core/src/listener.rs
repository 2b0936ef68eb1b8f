//! Listener and dispatcher: the producer side of the handoff.
//!
//! Connections are served strictly one at a time. For each one the
//! dispatcher builds a fresh sealed region, sends its handle, and drops both
//! the handle and the connection before the next `accept`.

use std::convert::Infallible;
use std::fmt;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::CapabilityChannel;
use crate::config::HandoffConfig;
use crate::error::{HandoffError, Result};
use crate::peer::peer_info;
use crate::region::RegionFactory;
use crate::socket::{lock_down_socket_path, remove_stale_socket};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Summary of one completed handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    /// 1-based count of connections this dispatcher has handled.
    pub sequence: u64,
    /// Message written into the region.
    pub tag: String,
}

/// Builds and sends one region per connection.
#[derive(Debug)]
pub struct Dispatcher {
    factory: RegionFactory,
    prefix: String,
    sequence: u64,
}

impl Dispatcher {
    pub fn new(config: &HandoffConfig) -> Self {
        Self {
            factory: RegionFactory::new(config),
            prefix: config.message_prefix.clone(),
            sequence: 0,
        }
    }

    /// Produce the content tag for the next connection.
    fn next_tag(&mut self) -> (u64, String) {
        self.sequence += 1;
        let tag = format!(
            "{}: connection {} ({})",
            self.prefix,
            self.sequence,
            Uuid::new_v4()
        );
        (self.sequence, tag)
    }

    /// Build a sealed region for `conn` and hand its capability over.
    ///
    /// The region is fully sealed before anything is sent, and the local
    /// handle is closed once the send returns.
    pub fn dispatch<C: CapabilityChannel + ?Sized>(&mut self, conn: &C) -> Result<Handoff> {
        let (sequence, tag) = self.next_tag();
        let region = self.factory.create(tag.as_bytes())?;
        region.hand_off(conn)?;
        Ok(Handoff { sequence, tag })
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    Serving,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Serving => write!(f, "serving"),
        }
    }
}

/// Result of serving a single accepted connection.
#[derive(Debug)]
pub enum ConnectionOutcome {
    Delivered(Handoff),
    /// The handoff failed. Only this connection is affected.
    Failed(HandoffError),
}

/// Owns the rendezvous socket and runs the accept loop.
#[derive(Debug)]
pub struct Listener {
    socket: UnixListener,
    path: PathBuf,
    dispatcher: Dispatcher,
    state: ListenerState,
}

impl Listener {
    /// Bind the configured socket path, replacing any stale socket file.
    pub fn bind(config: &HandoffConfig) -> Result<Self> {
        let path = config.socket_path.clone();
        remove_stale_socket(&path)?;
        let socket = UnixListener::bind(&path).map_err(|e| HandoffError::resource("bind", e))?;
        lock_down_socket_path(&path)?;

        info!("listening on {}", path.display());

        Ok(Self {
            socket,
            path,
            dispatcher: Dispatcher::new(config),
            state: ListenerState::Listening,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Block until a client connects, then serve it.
    ///
    /// An `Err` means `accept` itself failed and the loop should end.
    pub fn serve_next(&mut self) -> Result<ConnectionOutcome> {
        let (conn, _addr) = self
            .socket
            .accept()
            .map_err(|e| HandoffError::resource("accept", e))?;

        self.state = ListenerState::Serving;
        let outcome = self.serve(&conn);
        drop(conn);
        self.state = ListenerState::Listening;

        Ok(outcome)
    }

    fn serve(&mut self, conn: &UnixStream) -> ConnectionOutcome {
        match peer_info(conn.as_fd()) {
            Ok(peer) => info!(
                "client connected uid={} gid={} pid={}",
                peer.uid, peer.gid, peer.pid
            ),
            Err(_) => info!("client connected (peer creds unavailable)"),
        }

        match self.dispatcher.dispatch(conn) {
            Ok(handoff) => {
                info!(sequence = handoff.sequence, tag = %handoff.tag, "region handed off");
                ConnectionOutcome::Delivered(handoff)
            }
            Err(e) => {
                warn!(code = e.error_code(), "handoff failed: {e}");
                ConnectionOutcome::Failed(e)
            }
        }
    }

    /// Serve connections until `accept` fails. Never returns `Ok`.
    pub fn run(&mut self) -> Result<Infallible> {
        loop {
            self.serve_next()?;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::num::NonZeroUsize;
    use std::os::unix::fs::MetadataExt;
    use std::thread;

    use super::*;
    use crate::consumer::Consumer;

    fn config_in(dir: &Path) -> HandoffConfig {
        HandoffConfig::default().with_socket_path(dir.join("sealshm.sock"))
    }

    #[test]
    fn dispatcher_tags_are_distinct() {
        let mut dispatcher = Dispatcher::new(&HandoffConfig::default().with_message_prefix("p"));
        let (first_seq, first) = dispatcher.next_tag();
        let (second_seq, second) = dispatcher.next_tag();

        assert_eq!((first_seq, second_seq), (1, 2));
        assert!(first.starts_with("p: connection 1 ("));
        assert!(second.starts_with("p: connection 2 ("));
        assert_ne!(first, second);
    }

    #[test]
    fn dispatch_over_socketpair() {
        let config = HandoffConfig::default();
        let (producer, conn) = UnixStream::pair().unwrap();
        let mut dispatcher = Dispatcher::new(&config);

        let handoff = dispatcher.dispatch(&producer).unwrap();
        let verified = Consumer::new(&config).receive(&conn).unwrap();
        assert_eq!(verified.message().unwrap().to_str().unwrap(), handoff.tag);
    }

    #[test]
    fn sequential_clients_get_independent_regions() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut listener = Listener::bind(&config).unwrap();
        assert_eq!(listener.state(), ListenerState::Listening);

        let server = thread::spawn(move || {
            let mut tags = Vec::new();
            for _ in 0..2 {
                match listener.serve_next().unwrap() {
                    ConnectionOutcome::Delivered(h) => tags.push(h.tag),
                    ConnectionOutcome::Failed(e) => panic!("handoff failed: {e}"),
                }
                assert_eq!(listener.state(), ListenerState::Listening);
            }
            tags
        });

        let consumer = Consumer::new(&config);
        let mut messages = Vec::new();
        let mut inodes = Vec::new();
        for _ in 0..2 {
            let conn = UnixStream::connect(&config.socket_path).unwrap();
            let handle = conn.receive_capability().unwrap();
            let file = File::from(handle.try_clone().unwrap());
            inodes.push(file.metadata().unwrap().ino());

            let verified = consumer.verify(handle).unwrap();
            messages.push(verified.message().unwrap().to_str().unwrap().to_owned());
        }

        let tags = server.join().unwrap();
        assert_eq!(messages, tags);
        assert_ne!(messages[0], messages[1]);
        assert!(messages[0].contains("connection 1"));
        assert!(messages[1].contains("connection 2"));
        assert_ne!(inodes[0], inodes[1]);
    }

    #[test]
    fn failed_handoff_does_not_stop_listener() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path())
            .with_region_size(NonZeroUsize::new(16).unwrap())
            .with_message_prefix("a prefix far too long for sixteen bytes");
        let mut listener = Listener::bind(&config).unwrap();

        let server = thread::spawn(move || {
            let outcome = listener.serve_next().unwrap();
            (outcome, listener.state())
        });

        let conn = UnixStream::connect(&config.socket_path).unwrap();
        let (outcome, state) = server.join().unwrap();
        assert!(matches!(
            outcome,
            ConnectionOutcome::Failed(HandoffError::Policy(_))
        ));
        assert_eq!(state, ListenerState::Listening);

        // The server closed the connection without sending anything.
        let err = conn.receive_capability().unwrap_err();
        assert_eq!(err.error_code(), "protocol_error");
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        drop(UnixListener::bind(&config.socket_path).unwrap());
        assert!(config.socket_path.exists());

        let listener = Listener::bind(&config).unwrap();
        assert_eq!(listener.path(), config.socket_path.as_path());
        assert!(UnixStream::connect(&config.socket_path).is_ok());
    }

    #[test]
    fn run_ends_when_accept_fails() {
        use std::os::fd::AsRawFd;

        let dir = tempfile::tempdir().unwrap();
        let mut listener = Listener::bind(&config_in(dir.path())).unwrap();

        // A shut-down listening socket makes accept fail with EINVAL.
        let rc = unsafe { libc::shutdown(listener.socket.as_raw_fd(), libc::SHUT_RDWR) };
        assert_eq!(rc, 0);

        let Err(err) = listener.run();
        assert_eq!(err.error_code(), "resource_error");
        assert_eq!(listener.state(), ListenerState::Listening);
    }
}
