//! Container handle: lifecycle, exec, and tar transfers.
//!
//! A [`Container`] is a lightweight reference to an engine container. Exec
//! calls clone the container's process spec, overlay per-call environment
//! and working directory, and attach byte streams; file transfers run `tar`
//! inside the container and stream through the attached stdin/stdout.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::constants::PIPE_BUFFER_SIZE;
use crate::engine::{ContainerEngine, ExecStreams, InputStream, OutputStream, ProcessSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::platform::OciPlatform;
use crate::protocol::ContainerState;

/// Sequence counter for generating unique exec process identifiers.
static EXEC_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns a unique exec process identifier.
fn next_exec_id() -> String {
    format!("exec-{}", EXEC_SEQ.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Output of a command execution inside a container.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the process.
    pub exit_code: u32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// A build or service container backed by the engine.
#[derive(Clone)]
pub struct Container {
    engine: Arc<dyn ContainerEngine>,
    id: String,
    platform: OciPlatform,
}

impl Container {
    pub(crate) fn new(
        engine: Arc<dyn ContainerEngine>,
        id: &str,
        platform: OciPlatform,
    ) -> Self {
        Self {
            engine,
            id: id.to_string(),
            platform,
        }
    }

    /// The container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The platform the container was created for.
    pub fn platform(&self) -> &OciPlatform {
        &self.platform
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Queries the current state of the container.
    ///
    /// Returns [`ContainerState::Running`] if the task is active,
    /// [`ContainerState::Stopped`] if the container exists but has no
    /// running task, or [`ContainerState::NotCreated`] if the container does
    /// not exist.
    pub async fn status(&self) -> Result<ContainerState> {
        match self.engine.load_container(&self.id).await {
            Err(e) if e.is_not_found() => return Ok(ContainerState::NotCreated),
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        match self.engine.task_status(&self.id).await {
            Err(e) if e.is_not_found() => Ok(ContainerState::Stopped),
            Err(e) => Err(e),
            Ok(TaskStatus::Running) => Ok(ContainerState::Running),
            Ok(TaskStatus::Stopped) => Ok(ContainerState::Stopped),
        }
    }

    /// Stops the container's task.
    ///
    /// The running task is killed and deleted; the container metadata is
    /// preserved. Stopping an already-stopped container is not an error.
    pub async fn stop(&self) -> Result<()> {
        match self.engine.load_container(&self.id).await {
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        let _ = self.engine.kill_task(&self.id, libc::SIGKILL).await;
        match self.engine.delete_task(&self.id).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Removes the container and its resources.
    ///
    /// Best-effort: the task is killed and the container is deleted along
    /// with its snapshot. Failures are logged, never returned.
    pub async fn destroy(&self) {
        match self.engine.load_container(&self.id).await {
            Err(e) => {
                if !e.is_not_found() {
                    warn!("failed to load container {} for destruction: {}", self.id, e);
                }
                return;
            }
            Ok(_) => {}
        }

        let _ = self.engine.kill_task(&self.id, libc::SIGKILL).await;
        let _ = self.engine.delete_task(&self.id).await;

        if let Err(e) = self.engine.delete_container(&self.id).await
            && !e.is_not_found()
        {
            warn!("failed to delete container {} during destruction: {}", self.id, e);
        }
    }

    /// Removes an existing container with this id, if one exists.
    ///
    /// Recovers from previous crashes that left a container behind. No-op
    /// when nothing with the id is found.
    pub(crate) async fn remove_stale(&self) {
        if self.engine.load_container(&self.id).await.is_err() {
            return;
        }
        let _ = self.engine.kill_task(&self.id, libc::SIGKILL).await;
        let _ = self.engine.delete_task(&self.id).await;
        let _ = self.engine.delete_container(&self.id).await;
    }

    // =========================================================================
    // Exec
    // =========================================================================

    /// Runs a command inside the container.
    ///
    /// The command is passed to the shell as a single argument via
    /// `shell -c command`. Environment variables and working directory
    /// override the container's spec for this execution only. A non-zero
    /// exit code is not an error; callers inspect the code.
    pub async fn exec(
        &self,
        shell: &str,
        command: &str,
        env: &[String],
        workdir: &str,
    ) -> Result<ExecResult> {
        let (stdout_stream, stdout_buf) = capture();
        let (exit_code, stderr) = self
            .exec_command(
                None,
                Some(stdout_stream),
                env,
                workdir,
                vec![shell.to_string(), "-c".to_string(), command.to_string()],
            )
            .await?;

        Ok(ExecResult {
            exit_code,
            stdout: collect(stdout_buf).await,
            stderr,
        })
    }

    /// Runs a command and arguments directly inside the container.
    ///
    /// Unlike [`Container::exec`], the command is not wrapped in a shell.
    /// Suitable for CLI-invoked exec where the caller provides the full
    /// command line.
    pub async fn exec_args(&self, args: &[String]) -> Result<ExecResult> {
        let (stdout_stream, stdout_buf) = capture();
        let (exit_code, stderr) = self
            .exec_command(None, Some(stdout_stream), &[], "", args.to_vec())
            .await?;

        Ok(ExecResult {
            exit_code,
            stdout: collect(stdout_buf).await,
            stderr,
        })
    }

    /// Runs a command with captured stderr, returning the exit code.
    ///
    /// Builds the process spec by cloning the container's own spec and
    /// overlaying env and workdir, then delegates to [`Self::exec_process`].
    async fn exec_command(
        &self,
        stdin: Option<InputStream>,
        stdout: Option<OutputStream>,
        env: &[String],
        workdir: &str,
        args: Vec<String>,
    ) -> Result<(u32, String)> {
        let mut spec = self.engine.container_process_spec(&self.id).await?;
        spec.terminal = false;
        spec.args = args;
        if !env.is_empty() {
            spec.env = merge_env(&spec.env, env);
        }
        if !workdir.is_empty() {
            spec.cwd = workdir.to_string();
        }

        let (stderr_stream, stderr_buf) = capture();
        let exit_code = self
            .exec_process(spec, stdin, stdout, Some(stderr_stream))
            .await?;
        Ok((exit_code, collect(stderr_buf).await))
    }

    /// Starts a process in the container's running task, waits for it, and
    /// returns the exit code.
    ///
    /// A unique exec id is assigned. When stdin is provided it is wrapped so
    /// that the engine is told to close its write end of the stdin FIFO once
    /// the reader reaches end-of-stream; without that signal the exec
    /// process never sees EOF.
    async fn exec_process(
        &self,
        spec: ProcessSpec,
        stdin: Option<InputStream>,
        stdout: Option<OutputStream>,
        stderr: Option<OutputStream>,
    ) -> Result<u32> {
        let exec_id = next_exec_id();

        let stdin = stdin.map(|input| {
            let (tx, rx) = oneshot::channel();
            let engine = self.engine.clone();
            let container_id = self.id.clone();
            let id = exec_id.clone();
            tokio::spawn(async move {
                if rx.await.is_ok()
                    && let Err(err) = engine.close_stdin(&container_id, &id).await
                {
                    debug!("failed to close exec stdin: {}", err);
                }
            });
            Box::new(DoneReader::new(input, tx)) as InputStream
        });

        self.engine
            .exec(&self.id, &exec_id, spec, ExecStreams { stdin, stdout, stderr })
            .await
    }

    // =========================================================================
    // File Transfer
    // =========================================================================

    /// Creates a directory inside the container, including parents.
    pub async fn mkdir_all(&self, path: &str) -> Result<()> {
        self.must_exec("mkdir", None, None, string_args(&["mkdir", "-p", path]))
            .await
    }

    /// Copies a tar stream into the container's filesystem.
    ///
    /// The stream is extracted into `dest_dir` by piping it to
    /// `tar xf - -C dest_dir` inside the container.
    pub async fn copy_to(&self, reader: InputStream, dest_dir: &str) -> Result<()> {
        self.must_exec(
            "tar extract",
            Some(reader),
            None,
            string_args(&["tar", "xf", "-", "-C", dest_dir]),
        )
        .await
    }

    /// Copies a path out of the container's filesystem as a tar stream.
    ///
    /// The file or directory at `path` is archived with
    /// `tar cf - -C <dir> <base>` inside the container, streaming to the
    /// writer.
    pub async fn copy_from(&self, writer: OutputStream, path: &str) -> Result<()> {
        self.must_exec(
            "tar archive",
            None,
            Some(writer),
            string_args(&["tar", "cf", "-", "-C", &parent_dir(path), &base_name(path)]),
        )
        .await
    }

    /// Runs a command, treating a non-zero exit as a runtime error annotated
    /// with `desc` and the captured stderr.
    async fn must_exec(
        &self,
        desc: &str,
        stdin: Option<InputStream>,
        stdout: Option<OutputStream>,
        args: Vec<String>,
    ) -> Result<()> {
        let (exit_code, stderr) = self.exec_command(stdin, stdout, &[], "", args).await?;
        if exit_code != 0 {
            return Err(Error::Runtime(format!(
                "{desc} failed with exit code {exit_code} ({stderr})"
            )));
        }
        Ok(())
    }
}

/// Merges override env vars on top of a base env list.
///
/// Entries are `KEY=VALUE`; overrides win and malformed entries are
/// discarded.
fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<(String, String)> = Vec::with_capacity(base.len() + overrides.len());
    for entry in base.iter().chain(overrides) {
        if let Some((key, value)) = entry.split_once('=') {
            if let Some(existing) = merged.iter_mut().find(|(k, _)| k == key) {
                existing.1 = value.to_string();
            } else {
                merged.push((key.to_string(), value.to_string()));
            }
        }
    }
    merged.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Creates a capture pipe: the writer side is handed to an exec, the
/// returned task resolves to everything written once the writer is dropped.
fn capture() -> (OutputStream, tokio::task::JoinHandle<Vec<u8>>) {
    let (mut reader, writer) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    let handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    });
    (Box::new(writer), handle)
}

async fn collect(handle: tokio::task::JoinHandle<Vec<u8>>) -> String {
    String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned()
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Directory part of a container path.
pub(crate) fn parent_dir(path: &str) -> String {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => "/".to_string(),
    }
}

/// Final component of a container path.
pub(crate) fn base_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Wraps a stream and signals once when it reaches end-of-stream.
///
/// The signal fires exactly on the first EOF; later reads and non-EOF
/// errors do not trigger it again.
struct DoneReader<R> {
    inner: R,
    signal: Option<oneshot::Sender<()>>,
}

impl<R> DoneReader<R> {
    fn new(inner: R, signal: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            signal: Some(signal),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DoneReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result
            && buf.filled().len() == before
            && let Some(tx) = this.signal.take()
        {
            let _ = tx.send(());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_env_overrides_existing_key() {
        let mut merged = merge_env(
            &["A=1".to_string(), "B=2".to_string()],
            &["A=override".to_string()],
        );
        merged.sort();
        assert_eq!(merged, vec!["A=override", "B=2"]);
    }

    #[test]
    fn merge_env_adds_new_key() {
        let mut merged = merge_env(&["A=1".to_string()], &["B=2".to_string()]);
        merged.sort();
        assert_eq!(merged, vec!["A=1", "B=2"]);
    }

    #[test]
    fn merge_env_keeps_values_with_equals() {
        assert_eq!(merge_env(&["CMD=foo=bar".to_string()], &[]), vec!["CMD=foo=bar"]);
    }

    #[test]
    fn merge_env_discards_malformed_entries() {
        let mut merged = merge_env(
            &["NOEQUALS".to_string(), "A=1".to_string()],
            &["ALSO_BAD".to_string(), "B=2".to_string()],
        );
        merged.sort();
        assert_eq!(merged, vec!["A=1", "B=2"]);
    }

    #[test]
    fn merge_env_empty_inputs() {
        assert!(merge_env(&[], &[]).is_empty());
        assert_eq!(merge_env(&[], &["A=1".to_string()]), vec!["A=1"]);
    }

    #[test]
    fn exec_ids_are_unique_and_nonempty() {
        let a = next_exec_id();
        let b = next_exec_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn container_path_helpers() {
        assert_eq!(parent_dir("/usr/local/bin/tool"), "/usr/local/bin");
        assert_eq!(parent_dir("/tool"), "/");
        assert_eq!(base_name("/usr/local/bin/tool"), "tool");
        assert_eq!(base_name("tool"), "tool");
    }

    #[tokio::test]
    async fn done_reader_signals_on_eof() {
        let (tx, rx) = oneshot::channel();
        let mut reader = DoneReader::new(&b"data"[..], tx);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"data");
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn done_reader_does_not_signal_before_eof() {
        let (tx, mut rx) = oneshot::channel();
        let mut reader = DoneReader::new(&b"0123456789"[..], tx);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
