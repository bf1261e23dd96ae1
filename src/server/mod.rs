//! The daemon server.
//!
//! Listens on a Unix domain socket for JSON-encoded commands from the CLI.
//! Each connection carries a single request-response exchange: the client
//! sends one newline-delimited envelope, the server dispatches the command
//! and writes the result back before closing the connection.
//!
//! Build commands are cancelled when the client disconnects mid-build;
//! container cleanup still runs afterwards.

mod handlers;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::{ContainerEngine, LocalEngine};
use crate::error::{Error, Result};
use crate::paths;
use crate::protocol::{self, Command, ErrorResult};
use crate::runtime::Runtime;

/// Group name granting socket access. Members of this group can connect to
/// the daemon socket without owning the process.
const SOCKET_GROUP: &str = "cruxd";

/// Mode applied to the Unix socket: owner and group read-write (required
/// for connect), no access for others.
const SOCKET_MODE: u32 = 0o660;

/// Server configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Override for the Unix socket path. `None` uses the default.
    pub socket_path: Option<PathBuf>,
    /// Override for the engine state directory. `None` uses the default.
    pub state_dir: Option<PathBuf>,
}

/// Shared server state, accessible to connection handlers.
pub(crate) struct ServerState {
    pub(crate) socket_path: PathBuf,
    pub(crate) runtime: Runtime,
    pub(crate) started_at: Instant,
    /// Total number of build commands processed.
    pub(crate) builds: Mutex<u64>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl ServerState {
    /// Signals shutdown and removes runtime files.
    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(true);
        let _ = fs::remove_file(&self.socket_path);
        let _ = fs::remove_file(paths::pid_file());
    }
}

/// Listens on a Unix domain socket and dispatches commands.
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    /// Creates a server backed by the local engine.
    ///
    /// The socket is not opened until [`Server::start`] is called.
    pub fn new(config: Config) -> Result<Self> {
        let state_dir = config
            .state_dir
            .clone()
            .unwrap_or_else(paths::state_dir);
        let engine = Arc::new(LocalEngine::new(state_dir)?);
        Ok(Self::with_engine(config, engine))
    }

    /// Creates a server over an arbitrary container engine.
    pub fn with_engine(config: Config, engine: Arc<dyn ContainerEngine>) -> Self {
        let socket_path = config.socket_path.unwrap_or_else(paths::socket_path);
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(ServerState {
                socket_path,
                runtime: Runtime::new(engine),
                started_at: Instant::now(),
                builds: Mutex::new(0),
                shutdown,
            }),
        }
    }

    /// The path the server listens on.
    pub fn socket_path(&self) -> &Path {
        &self.state.socket_path
    }

    /// Opens the Unix socket and begins accepting connections.
    pub fn start(&self) -> Result<()> {
        let listener = listen(&self.state.socket_path)?;

        if let Err(err) = write_pid() {
            warn!("failed to write PID file: {}", err);
        }

        info!("server listening on {}", self.state.socket_path.display());

        let state = self.state.clone();
        tokio::spawn(accept_loop(listener, state));
        Ok(())
    }

    /// Shuts down the server and cleans up runtime files.
    pub fn stop(&self) {
        self.state.stop();
    }

    /// Blocks until the server stops.
    pub async fn wait(&self) {
        let mut rx = self.state.shutdown.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Creates the socket listener, removing any stale socket from a previous
/// run, and applies permissions.
fn listen(socket_path: &Path) -> Result<UnixListener> {
    fs::create_dir_all(paths::runtime_dir()).map_err(|e| Error::Server(e.to_string()))?;

    let _ = fs::remove_file(socket_path);

    let listener = UnixListener::bind(socket_path)
        .map_err(|e| Error::Server(format!("failed to listen on {}: {e}", socket_path.display())))?;

    if let Err(err) = set_socket_permissions(socket_path) {
        drop(listener);
        let _ = fs::remove_file(socket_path);
        return Err(err);
    }

    Ok(listener)
}

/// Restricts socket access to owner and group.
///
/// The daemon does not run as root; any user in the `cruxd` group can also
/// connect. When the group does not resolve, the socket stays owner-only.
fn set_socket_permissions(socket_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|e| Error::Server(format!("failed to chmod socket: {e}")))?;
    }

    match lookup_group(SOCKET_GROUP) {
        Some(gid) => {
            if let Err(err) = chgrp(socket_path, gid) {
                warn!("failed to chgrp socket to {}: {}", SOCKET_GROUP, err);
            }
        }
        None => warn!(
            "socket group {:?} not found, socket accessible to owner only",
            SOCKET_GROUP
        ),
    }

    Ok(())
}

/// Resolves a group name to its gid.
fn lookup_group(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    // SAFETY: getgrnam returns a pointer into static storage; the gid is
    // copied out before any other group lookup can run (server startup is
    // single-threaded).
    unsafe {
        let group = libc::getgrnam(c_name.as_ptr());
        if group.is_null() {
            None
        } else {
            Some((*group).gr_gid)
        }
    }
}

/// Changes a path's group, leaving the owner unchanged.
fn chgrp(path: &Path, gid: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: plain chown(2) call with a valid NUL-terminated path.
    let rc = unsafe { libc::chown(c_path.as_ptr(), u32::MAX as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Writes the daemon PID so the CLI can detect a running daemon and signal
/// it.
fn write_pid() -> Result<()> {
    fs::create_dir_all(paths::runtime_dir()).map_err(|e| Error::FileSystem(e.to_string()))?;
    fs::write(paths::pid_file(), format!("{}", std::process::id()))
        .map_err(|e| Error::FileSystem(e.to_string()))
}

/// Accepts connections until shutdown is signalled.
async fn accept_loop(listener: UnixListener, state: Arc<ServerState>) {
    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(handle(stream, state));
                    }
                    Err(err) => error!("accept error: {}", err),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Processes a single connection.
///
/// Reads one newline-delimited JSON message, dispatches the command, and
/// writes the response. The connection is closed after one exchange.
async fn handle(stream: UnixStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = Vec::new();
    match tokio::io::AsyncBufReadExt::read_until(&mut reader, b'\n', &mut line).await {
        Ok(0) => return,
        Ok(_) => {}
        Err(err) => {
            error!("read error: {}", err);
            return;
        }
    }

    let envelope = match protocol::decode(&line) {
        Ok(envelope) => envelope,
        Err(err) => {
            handlers::respond(
                &mut write_half,
                Command::Error,
                ErrorResult {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }
    };

    info!("command received: {}", envelope.command);
    handlers::dispatch(&state, envelope, reader, &mut write_half).await;
}

/// Resolves when the remote end of the connection closes.
///
/// Detection works by reading from the connection: the read blocks until
/// the peer closes, then returns. No further request data is expected on a
/// connection for the lifetime of this future; if data does arrive it is
/// discarded and the future resolves prematurely.
pub(crate) async fn connection_closed<R: AsyncRead + Unpin>(mut reader: R) {
    let mut buf = [0u8; 1];
    let _ = reader.read(&mut buf).await;
}
