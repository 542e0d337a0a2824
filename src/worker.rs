//! Per-connection workers.
//!
//! A worker performs exactly one exchange on a connection:
//!
//! ```text
//! read message -> sleep(timeout) -> transform -> sleep(timeout) -> write reply
//! ```
//!
//! Two flavours are supported:
//! - `Task`: the exchange runs in a tokio task that owns the socket
//! - `Process`: this binary is re-executed with the `handle` subcommand and
//!   the socket as its stdin/stdout; its stderr is forwarded to the error log

use crate::config::{Config, HandleArgs, WorkerMode};
use crate::protocol::{Transformer, INVALID_DATA_REPLY};
use bytes::BytesMut;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Largest message accepted in the single read.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Failure of a single exchange.
#[derive(Debug)]
pub enum ExchangeError {
    /// Reading the client message failed.
    Read(io::Error),
    /// The peer closed the connection without sending anything.
    Closed,
    /// Writing the reply failed.
    Write(io::Error),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Read(e) => write!(f, "failed to read message: {}", e),
            ExchangeError::Closed => write!(f, "connection closed before a message arrived"),
            ExchangeError::Write(e) => write!(f, "failed to send reply: {}", e),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Run one exchange: read a message, transform it, write the reply.
///
/// Both delays are applied whether the message is accepted or rejected.
/// Returns the reply that was sent.
pub async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    delay: Duration,
    transformer: &Transformer,
) -> Result<String, ExchangeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
    let n = reader
        .read_buf(&mut buffer)
        .await
        .map_err(ExchangeError::Read)?;
    if n == 0 {
        return Err(ExchangeError::Closed);
    }

    info!(
        message = %String::from_utf8_lossy(&buffer).trim_end(),
        "message received from client"
    );

    tokio::time::sleep(delay).await;

    let reply = match transformer.transform(&buffer) {
        Ok(reply) => reply,
        Err(rejection) => {
            info!(reason = %rejection, "rejecting message");
            INVALID_DATA_REPLY.to_string()
        }
    };

    tokio::time::sleep(delay).await;

    writer
        .write_all(reply.as_bytes())
        .await
        .map_err(ExchangeError::Write)?;
    writer.flush().await.map_err(ExchangeError::Write)?;
    writer.shutdown().await.map_err(ExchangeError::Write)?;

    info!(reply = %reply, "message sent to client");
    Ok(reply)
}

/// Exchange over a TCP connection owned by the calling task.
async fn serve_stream(
    mut stream: TcpStream,
    delay: Duration,
    transformer: Arc<Transformer>,
) -> Result<(), ExchangeError> {
    let (mut reader, mut writer) = stream.split();
    exchange(&mut reader, &mut writer, delay, &transformer).await?;
    Ok(())
}

/// Entry point of a worker process: one exchange over stdin/stdout.
pub async fn handle_stdio(args: &HandleArgs) -> Result<String, ExchangeError> {
    let transformer = Transformer::new(args.signature.clone());
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    exchange(
        &mut stdin,
        &mut stdout,
        Duration::from_secs(args.timeout),
        &transformer,
    )
    .await
}

/// Worker could not be started.
#[derive(Debug)]
pub enum DispatchError {
    /// The worker executable could not be determined.
    Program(io::Error),
    /// The socket could not be handed to the worker.
    Socket(io::Error),
    /// The worker process failed to launch.
    Spawn(io::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Program(e) => write!(f, "failed to locate worker program: {}", e),
            DispatchError::Socket(e) => write!(f, "failed to pass socket to worker: {}", e),
            DispatchError::Spawn(e) => write!(f, "failed to start worker process: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A worker ended badly, or could not be stopped.
#[derive(Debug)]
pub enum WorkerError {
    /// The in-process exchange failed.
    Exchange(ExchangeError),
    /// The worker task panicked.
    Join(JoinError),
    /// The worker process exited unsuccessfully.
    Exit(ExitStatus),
    /// Waiting on the worker process failed.
    Wait(io::Error),
    /// Killing the worker process failed.
    Kill(io::Error),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Exchange(e) => write!(f, "{}", e),
            WorkerError::Join(e) => write!(f, "worker task failed: {}", e),
            WorkerError::Exit(status) => write!(f, "worker process exited with {}", status),
            WorkerError::Wait(e) => write!(f, "failed to wait for worker process: {}", e),
            WorkerError::Kill(e) => write!(f, "failed to kill worker process: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

/// A running worker bound to one connection.
///
/// The handle owns the connection (directly for tasks, as the parent's copy
/// of the socket for processes); dropping it closes the connection.
#[derive(Debug)]
pub enum WorkerHandle {
    Task(JoinHandle<Result<(), ExchangeError>>),
    Process {
        child: Child,
        /// Parent's copy of the socket, closed when the handle is dropped.
        _connection: std::net::TcpStream,
    },
}

impl WorkerHandle {
    /// Wait for the worker to exit on its own.
    ///
    /// Cancel safe: dropping the future leaves the worker running.
    pub async fn wait(&mut self) -> Result<(), WorkerError> {
        match self {
            WorkerHandle::Task(handle) => match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(WorkerError::Exchange(e)),
                Err(e) => Err(WorkerError::Join(e)),
            },
            WorkerHandle::Process { child, .. } => {
                let status = child.wait().await.map_err(WorkerError::Wait)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(WorkerError::Exit(status))
                }
            }
        }
    }

    /// Forcibly stop the worker and wait until it is gone.
    pub async fn kill(&mut self) -> Result<(), WorkerError> {
        match self {
            WorkerHandle::Task(handle) => {
                handle.abort();
                match handle.await {
                    Err(e) if e.is_panic() => Err(WorkerError::Join(e)),
                    _ => Ok(()),
                }
            }
            WorkerHandle::Process { child, .. } => child.kill().await.map_err(WorkerError::Kill),
        }
    }

    /// OS process id, for process workers that have not been reaped.
    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerHandle::Task(_) => None,
            WorkerHandle::Process { child, .. } => child.id(),
        }
    }
}

/// Start a worker for `stream` according to the configured mode.
///
/// On failure the stream is dropped, closing the connection without a reply.
pub fn dispatch(
    stream: TcpStream,
    config: &Config,
    transformer: &Arc<Transformer>,
) -> Result<WorkerHandle, DispatchError> {
    match config.worker {
        WorkerMode::Task => {
            let handle = tokio::spawn(serve_stream(
                stream,
                config.timeout,
                Arc::clone(transformer),
            ));
            Ok(WorkerHandle::Task(handle))
        }
        WorkerMode::Process => spawn_process(stream, config),
    }
}

fn spawn_process(stream: TcpStream, config: &Config) -> Result<WorkerHandle, DispatchError> {
    let program = match &config.worker_program {
        Some(program) => program.clone(),
        None => std::env::current_exe().map_err(DispatchError::Program)?,
    };

    // The child does blocking I/O on the socket.
    let connection = stream.into_std().map_err(DispatchError::Socket)?;
    connection
        .set_nonblocking(false)
        .map_err(DispatchError::Socket)?;
    let stdin = OwnedFd::from(connection.try_clone().map_err(DispatchError::Socket)?);
    let stdout = OwnedFd::from(connection.try_clone().map_err(DispatchError::Socket)?);

    // Not killed on drop: a child outlives an immediate shutdown and still
    // answers its client. Only the watchdog kills workers.
    let mut child = Command::new(&program)
        .args(worker_args(config))
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(DispatchError::Spawn)?;

    let pid = child.id();
    debug!(pid, program = %program.display(), "worker process started");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr, pid));
    }

    Ok(WorkerHandle::Process {
        child,
        _connection: connection,
    })
}

/// Command line of a worker process: the `handle` subcommand.
fn worker_args(config: &Config) -> Vec<OsString> {
    vec![
        "handle".into(),
        "--timeout".into(),
        config.timeout.as_secs().to_string().into(),
        "--signature".into(),
        config.signature.clone().into(),
        "--log-level".into(),
        config.log_level.clone().into(),
        "--activity-log".into(),
        config.log_file.clone().into_os_string(),
    ]
}

/// Copy each stderr line of a worker process into the error log.
async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(pid, "worker: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(pid, error = %e, "stopped reading worker stderr");
                break;
            }
        }
    }
}
