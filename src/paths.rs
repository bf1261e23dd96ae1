//! Platform-appropriate paths for the daemon.
//!
//! Runtime files (socket, PID) follow XDG conventions on Linux and live
//! under the user cache directory elsewhere. Persistent engine state goes
//! to the user data directory.

use std::path::PathBuf;

use crate::constants::DAEMON_NAME;

/// Directory for runtime files (socket, PID).
///
/// Linux: `$XDG_RUNTIME_DIR/cruxd`. Elsewhere (and when the variable is
/// unset): `<cache dir>/cruxd/run`, e.g. `~/Library/Caches/cruxd/run` on
/// macOS.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir).join(DAEMON_NAME);
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DAEMON_NAME)
        .join("run")
}

/// Default path of the Unix domain socket for CLI-to-daemon communication.
pub fn socket_path() -> PathBuf {
    runtime_dir().join(format!("{DAEMON_NAME}.sock"))
}

/// Default path of the PID file.
pub fn pid_file() -> PathBuf {
    runtime_dir().join(format!("{DAEMON_NAME}.pid"))
}

/// Directory for persistent engine state (blobs, images, containers).
pub fn state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DAEMON_NAME)
}
