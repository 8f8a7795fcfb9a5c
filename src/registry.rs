use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Identity, ServerEvent};

/// Frames delivered to a connection's writer loop.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    /// Close the socket with a policy code. Sent when a newer connection
    /// for the same identity supersedes this one.
    Close,
}

/// Cheap handle to one live connection: the per-connection id plus the
/// sender half of its outbound channel. Sessions hold these as
/// back-references; the registry holds the authoritative one per identity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub identity: Identity,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(identity: Identity) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                identity,
                tx,
            },
            rx,
        )
    }

    pub fn send(&self, event: ServerEvent) {
        if self.tx.send(Outbound::Event(event)).is_err() {
            warn!(
                user_id = %self.identity.id,
                "attempted to send to a closed connection"
            );
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Maps a verified identity to its single live connection. At most one
/// connection per identity; registering a new one evicts the old.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the handle, closing any previous connection for the same
    /// identity before returning.
    pub fn register(&self, handle: ConnectionHandle) {
        let previous = self
            .inner
            .lock()
            .unwrap()
            .insert(handle.identity.id.clone(), handle);
        if let Some(old) = previous {
            warn!(user_id = %old.identity.id, "duplicate connection, closing old one");
            old.close();
        }
    }

    /// Removes the mapping only if the stored connection is the one that is
    /// closing. A stale close event arriving after a newer registration is
    /// a no-op. Returns whether the mapping was removed.
    pub fn unregister(&self, identity_id: &str, conn_id: Uuid) -> bool {
        let mut map = self.inner.lock().unwrap();
        if map.get(identity_id).map(|h| h.conn_id) == Some(conn_id) {
            map.remove(identity_id);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, identity_id: &str) -> Option<ConnectionHandle> {
        self.inner.lock().unwrap().get(identity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
