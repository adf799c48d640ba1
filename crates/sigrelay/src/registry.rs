use sigrelay_common::ClientId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Errors from [`Registry`] operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Identifiers must be non-empty.
    #[error("invalid client id")]
    InvalidId,
}

/// Why a [`ConnHandle::send`] did not enqueue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection's outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The owning session has ended.
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Default)]
struct CloseSignal {
    reason: OnceLock<&'static str>,
    notify: Notify,
}

/// Handle held in the registry, used to send text frames to a connection
/// and to ask its session to close.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::Sender<String>,
    close: Arc<CloseSignal>,
}

impl ConnHandle {
    /// Create a handle and the receiver its session drains.
    #[must_use]
    pub fn new(queue: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue);
        let handle = Self {
            id: ConnId::next(),
            tx,
            close: Arc::new(CloseSignal::default()),
        };
        (handle, rx)
    }

    /// Identity of the underlying connection.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a text frame without waiting.
    pub fn send(&self, text: String) -> Result<(), SendError> {
        if self.close.reason.get().is_some() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the owning session to close with `reason`.
    ///
    /// Returns `false` if the connection was already closing; the first reason wins.
    pub fn close(&self, reason: &'static str) -> bool {
        if self.close.reason.set(reason).is_err() {
            return false;
        }
        self.close.notify.notify_one();
        true
    }

    /// The reason passed to the first [`close`](Self::close), if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<&'static str> {
        self.close.reason.get().copied()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) -> &'static str {
        loop {
            if let Some(reason) = self.close_reason() {
                return reason;
            }
            self.close.notify.notified().await;
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<ClientId, ConnHandle>,
    by_conn: HashMap<ConnId, ClientId>,
}

/// Concurrent id ↔ connection registry.
///
/// Holds at most one connection per id and at most one id per connection.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `handle`, returning the connection it displaced.
    ///
    /// The caller closes the returned handle; this only rewires the maps.
    pub fn register(
        &self,
        id: ClientId,
        handle: ConnHandle,
    ) -> Result<Option<ConnHandle>, RegistryError> {
        if id.is_empty() {
            return Err(RegistryError::InvalidId);
        }
        let conn = handle.id();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = inner.by_conn.remove(&conn) {
            if previous != id {
                inner.by_id.remove(&previous);
            }
        }

        let evicted = inner
            .by_id
            .insert(id.clone(), handle)
            .filter(|old| old.id() != conn);
        if let Some(old) = &evicted {
            inner.by_conn.remove(&old.id());
        }
        inner.by_conn.insert(conn, id);
        Ok(evicted)
    }

    /// Remove `id` only while it still points at `conn`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unregister(&self, id: &str, conn: ConnId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.by_id.get(id) {
            Some(current) if current.id() == conn => {
                inner.by_id.remove(id);
                inner.by_conn.remove(&conn);
                true
            }
            _ => false,
        }
    }

    /// Look up the live connection for `id`.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<ConnHandle> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.get(id).cloned()
    }

    /// Point-in-time copy of every entry, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ClientId, ConnHandle)> {
        let mut entries: Vec<_> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner
                .by_id
                .iter()
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.by_id.keys().cloned().collect()
        };
        ids.sort();
        ids
    }

    /// Number of registered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
