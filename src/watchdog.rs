//! Deadline enforcement for workers.
//!
//! Each worker is raced against a deadline. Whichever happens first is the
//! only one acted on: a natural exit is recorded, an expired deadline kills
//! the worker.

use crate::worker::WorkerHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How supervision of a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The worker exited successfully.
    Completed,
    /// The worker exited with an error.
    Failed,
    /// The deadline expired and the worker was terminated.
    TimedOut,
    /// The deadline expired and terminating the worker failed.
    KillFailed,
}

/// Wait for `handle` to exit, terminating it once `deadline` has elapsed.
///
/// The caller closes the connection by dropping the handle afterwards.
pub async fn supervise(handle: &mut WorkerHandle, deadline: Duration) -> Outcome {
    match tokio::time::timeout(deadline, handle.wait()).await {
        Ok(Ok(())) => {
            debug!("worker finished");
            Outcome::Completed
        }
        Ok(Err(e)) => {
            warn!(error = %e, "worker finished with error");
            Outcome::Failed
        }
        Err(_) => {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                pid = handle.pid(),
                "worker exceeded deadline, terminating"
            );
            match handle.kill().await {
                Ok(()) => Outcome::TimedOut,
                Err(e) => {
                    error!(error = %e, "failed to terminate worker");
                    Outcome::KillFailed
                }
            }
        }
    }
}
