//! Termination signal handling.
//!
//! SIGINT and SIGTERM both request shutdown. Handlers are installed before
//! the server starts accepting so a signal during startup is not lost.
//!
//! Handlers are process-wide, so the only test raising a real signal lives
//! with the accept loop in `server.rs`.

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

/// Installed SIGINT/SIGTERM handlers.
#[derive(Debug)]
pub struct TerminationSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl TerminationSignal {
    /// Register handlers for SIGINT and SIGTERM.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first termination request.
    pub async fn recv(mut self) {
        let name = tokio::select! {
            received = self.interrupt.recv() => received.map(|_| "SIGINT"),
            received = self.terminate.recv() => received.map(|_| "SIGTERM"),
        };

        match name {
            Some(name) => info!(signal = name, "shutdown signal received"),
            None => warn!("signal stream closed, shutting down"),
        }
    }
}

