//! Process-wide session context shared by every peer connection.
//!
//! Peer read callbacks traverse state that is shared across torrents
//! (peer sets, piece bookkeeping, bandwidth accounting), so the read
//! dispatcher holds a session-wide lock for the duration of each
//! callback loop. The lock is re-entrant: higher-level APIs may already
//! hold it when they install handlers or poke a connection.
//!
//! The session also carries the type-of-service byte applied to every
//! peer socket at connect time.

use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

struct Inner {
    lock: ReentrantMutex<()>,
    peer_socket_tos: u32,
}

/// Shared handle to the session context. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Creates a session with the given peer-socket ToS byte.
    pub fn new(peer_socket_tos: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                lock: ReentrantMutex::new(()),
                peer_socket_tos,
            }),
        }
    }

    /// Acquires the session lock. No blocking I/O may be performed while
    /// the guard is held.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.lock.lock()
    }

    /// The type-of-service byte applied to peer sockets.
    pub fn peer_socket_tos(&self) -> u32 {
        self.inner.peer_socket_tos
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(0)
    }
}
