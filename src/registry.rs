//! Registry of in-flight connections.
//!
//! Each accepted connection registers a session and holds a guard until its
//! worker is done. The registry is only used to drain on shutdown; it never
//! limits how many connections are accepted.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;

/// A connection being served.
#[derive(Debug, Clone)]
pub struct Session {
    /// Remote peer address.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: Instant,
}

/// Registry of live sessions using slab allocation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Slab<Session>>,
    idle: Notify,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Session>> {
        // A panic while holding the lock cannot leave the slab half-updated.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session; it is removed when the guard is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> SessionGuard {
        let id = self.lock().insert(Session {
            peer,
            accepted_at: Instant::now(),
        });

        SessionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Copy of every live session with its id.
    pub fn snapshot(&self) -> Vec<(usize, Session)> {
        self.lock()
            .iter()
            .map(|(id, session)| (id, session.clone()))
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until every registered session has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, id: usize) {
        let mut sessions = self.lock();
        sessions.try_remove(id);
        if sessions.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: usize,
}

impl SessionGuard {
    /// Slab key of this session; reused after the session ends.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
