use std::io;
use std::path::{Path, PathBuf};

use crate::error::{HandoffError, Result};

/// Rendezvous socket used when nothing else is configured.
pub const DEFAULT_SOCKET_PATH: &str = "./sealshm.sock";

/// Environment variable the client consults for the socket path.
pub const SOCKET_ENV_VAR: &str = "SEALSHM_SOCK";

/// Resolve the socket path, optionally allowing the `SEALSHM_SOCK` env override.
///
/// The daemon calls `resolve_socket_path(false)` so that its environment
/// cannot redirect where it binds. The CLI uses `socket_path()`.
pub fn resolve_socket_path(allow_env_override: bool) -> PathBuf {
    if allow_env_override
        && let Ok(p) = std::env::var(SOCKET_ENV_VAR)
        && !p.is_empty()
    {
        return PathBuf::from(p);
    }
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Resolve the socket path (client-side, allows env override).
pub fn socket_path() -> PathBuf {
    resolve_socket_path(true)
}

/// Remove a socket file left behind by an earlier run.
///
/// A missing file, or one we may not remove, is not a conflict worth failing
/// over; `bind` reports a real one.
pub fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
            Ok(())
        }
        Err(e) => Err(HandoffError::resource("unlink(socket)", e)),
    }
}

/// Only allow the owning user to connect.
pub fn lock_down_socket_path(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| HandoffError::resource("chmod(socket)", e))
}
