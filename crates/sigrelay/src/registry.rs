use crate::error::RelayError;
use crate::payload::Payload;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identity assigned to a connection at registration. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Send capability for one registered connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Registry-assigned identity.
    pub id: ConnId,
    /// Queue feeding the connection's task.
    pub tx: mpsc::Sender<Payload>,
    /// Remote address of the peer.
    pub peer: SocketAddr,
    /// Cancelled when the connection leaves the registry.
    pub evicted: CancellationToken,
}

#[derive(Debug, Default)]
struct Members {
    conns: BTreeMap<ConnId, ConnHandle>,
    closed: bool,
}

/// Set of currently open connections.
///
/// The registry holds the only long-lived sender for each connection's
/// queue. Removing an entry cancels the connection's eviction token right
/// away, and closes its queue once any in-flight snapshots are dropped.
#[derive(Debug)]
pub struct Registry {
    members: Mutex<Members>,
    next_id: AtomicU64,
}

impl Registry {
    /// Create an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Members::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection and return its freshly assigned id.
    ///
    /// `evicted` is cancelled when the entry is removed, whether by
    /// [`Registry::unregister`] or [`Registry::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RegistrationFailed`] once [`Registry::shutdown`]
    /// has been called.
    pub fn register(
        &self,
        tx: mpsc::Sender<Payload>,
        peer: SocketAddr,
        evicted: CancellationToken,
    ) -> Result<ConnId, RelayError> {
        let mut members = self.lock();
        if members.closed {
            return Err(RelayError::RegistrationFailed);
        }
        // Allocated under the lock so ids are ordered the same way as the
        // registrations that own them.
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        members.conns.insert(
            id,
            ConnHandle {
                id,
                tx,
                peer,
                evicted,
            },
        );
        Ok(id)
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn unregister(&self, id: ConnId) -> bool {
        // Drop the handle outside the lock.
        let removed = self.lock().conns.remove(&id);
        match removed {
            Some(handle) => {
                handle.evicted.cancel();
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every member, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnHandle> {
        self.lock().conns.values().cloned().collect()
    }

    /// Refuse further registrations and drop every member.
    ///
    /// Returns the number of connections that were dropped. Calling it
    /// again is harmless and returns 0.
    pub fn shutdown(&self) -> usize {
        let drained = {
            let mut members = self.lock();
            members.closed = true;
            std::mem::take(&mut members.conns)
        };
        for handle in drained.values() {
            handle.evicted.cancel();
        }
        drained.len()
    }

    /// Whether [`Registry::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.lock().closed
    }

    /// Whether the given connection is currently registered.
    #[must_use]
    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().conns.contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    /// Returns `true` if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().conns.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
