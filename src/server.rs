//! TCP server: accept loop and per-connection supervision.
//!
//! Every accepted connection gets its own task, which starts a worker,
//! supervises it with the watchdog and closes the connection afterwards.
//! The accept loop never waits on these tasks. On shutdown the listener is
//! closed and, depending on the configured mode, live sessions are drained.

use crate::config::{Config, ShutdownMode};
use crate::protocol::Transformer;
use crate::registry::{SessionGuard, SessionRegistry};
use crate::shutdown::TerminationSignal;
use crate::watchdog;
use crate::worker;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Arc<Config>,
    transformer: Arc<Transformer>,
    sessions: Arc<SessionRegistry>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let transformer = Transformer::new(config.signature.clone());

        Server {
            config: Arc::new(config),
            transformer: Arc::new(transformer),
            sessions: SessionRegistry::new(),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listen = self.config.listen_addr();
        let addr = lookup_host(&listen).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address '{}' did not resolve", listen),
            )
        })?;

        TcpListener::from_std(create_listener(addr)?)
    }

    /// Start the server and serve until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let signal = TerminationSignal::install()?;
        let listener = self.bind().await?;
        info!(address = %listener.local_addr()?, "Server listening");

        self.serve(listener, signal.recv()).await;
        self.finish().await;
        Ok(())
    }

    /// Accept connections until `shutdown` resolves, then close the listener.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("stopping accept loop");
                    break;
                }

                result = listener.accept() => match result {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        drop(listener);
        info!("listener closed");
    }

    /// Drain or abandon live sessions according to the shutdown mode.
    pub async fn finish(&self) {
        let live = self.sessions.len();

        match self.config.shutdown {
            ShutdownMode::Immediate => {
                info!(live, "exiting without waiting for connections");
            }
            ShutdownMode::Drain => {
                info!(
                    live,
                    drain_timeout_secs = self.config.drain_timeout.as_secs(),
                    "waiting for connections to finish"
                );
                match tokio::time::timeout(self.config.drain_timeout, self.sessions.wait_idle())
                    .await
                {
                    Ok(()) => info!("all connections drained"),
                    Err(_) => {
                        for (id, session) in self.sessions.snapshot() {
                            warn!(
                                session = id,
                                peer = %session.peer,
                                age_secs = session.accepted_at.elapsed().as_secs(),
                                "connection still open"
                            );
                        }
                        warn!("drain timed out, exiting with connections open");
                    }
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let session = self.sessions.register(peer);
        info!(peer = %peer, session = session.id(), "client connected");

        tokio::spawn(handle_connection(
            stream,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.transformer),
            session,
        ));
    }

    /// Get a reference to the session registry for testing
    #[cfg(test)]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

/// Serve one connection: dispatch a worker, supervise it, close.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    transformer: Arc<Transformer>,
    session: SessionGuard,
) {
    let mut worker = match worker::dispatch(stream, &config, &transformer) {
        Ok(worker) => worker,
        Err(e) => {
            error!(peer = %peer, session = session.id(), error = %e, "Failed to start worker");
            return;
        }
    };

    let outcome = watchdog::supervise(&mut worker, config.watchdog_timeout).await;
    drop(worker);

    debug!(peer = %peer, ?outcome, "worker supervised");
    info!(peer = %peer, session = session.id(), "client disconnected");
}

/// Create a listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
