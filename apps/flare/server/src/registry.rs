//! The set of live connections. Every mutation and every fan-out snapshot goes
//! through one mutex; the guarded section only touches the map, never a socket.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use flare_core::{ChatMessage, Identity};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DeliveryError;

pub type ConnectionId = Uuid;

/// What a connection's writer task receives.
pub type Outbound = Arc<ChatMessage>;

/// Registry entry for one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    remote_addr: Option<SocketAddr>,
    sender: mpsc::Sender<Outbound>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle plus the receiving end its writer drains. The handle's
    /// close token is a child of `shutdown`, so process shutdown closes it too.
    pub fn open(
        identity: Identity,
        remote_addr: Option<SocketAddr>,
        capacity: usize,
        shutdown: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            identity,
            remote_addr,
            sender,
            closer: shutdown.child_token(),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Single non-blocking write attempt.
    pub fn deliver(&self, message: &Outbound) -> Result<(), DeliveryError> {
        if self.closer.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        match self.sender.try_send(Arc::clone(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Saturated),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Waits for queue capacity instead of failing when full. Only used for
    /// the history replay, which must not drop records.
    pub async fn deliver_in_order(&self, message: Outbound) -> Result<(), DeliveryError> {
        tokio::select! {
            biased;
            _ = self.closer.cancelled() => Err(DeliveryError::Closed),
            sent = self.sender.send(message) => sent.map_err(|_| DeliveryError::Closed),
        }
    }

    /// Tears the connection down: its writer and receive loop both stop.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle`. Returns `false` and leaves the existing entry alone
    /// if the same connection is already present.
    pub fn add(&self, handle: ConnectionHandle) -> bool {
        let mut guard = self.inner.lock();
        match guard.entry(handle.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Unregisters a connection. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.lock().remove(&id)
    }

    /// Entries as of one instant, copied out so fan-out runs without the lock.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live connection count per identity.
    pub fn identity_counts(&self) -> BTreeMap<String, usize> {
        let guard = self.inner.lock();
        let mut counts = BTreeMap::new();
        for handle in guard.values() {
            *counts.entry(handle.identity.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn handle(name: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        ConnectionHandle::open(
            Identity::new(name).unwrap(),
            None,
            8,
            &CancellationToken::new(),
        )
    }

    #[test_timeout::timeout]
    fn removing_absent_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = handle("alice");
        assert!(registry.remove(a.id()).is_none());

        assert!(registry.add(a.clone()));
        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn same_connection_is_never_registered_twice() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = handle("alice");
        assert!(registry.add(a.clone()));
        assert!(!registry.add(a.clone()));
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn identities_may_repeat_across_connections() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice");
        let (second, _rx2) = handle("alice");
        let (third, _rx3) = handle("bob");
        registry.add(first);
        registry.add(second);
        registry.add(third);

        let counts = registry.identity_counts();
        assert_eq!(counts.get("alice"), Some(&2));
        assert_eq!(counts.get("bob"), Some(&1));
    }

    #[test_timeout::timeout]
    fn snapshot_is_not_affected_by_later_changes() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = handle("alice");
        let (b, _rx2) = handle("bob");
        registry.add(a.clone());

        let snapshot = registry.snapshot();
        registry.add(b);
        registry.remove(a.id());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), a.id());
    }

    #[test_timeout::timeout(30)]
    fn concurrent_add_and_remove_loses_no_updates() {
        let registry = ConnectionRegistry::new();
        let mut workers = Vec::new();

        for worker in 0..8 {
            let registry = registry.clone();
            workers.push(std::thread::spawn(move || {
                let mut kept = Vec::new();
                for i in 0..200 {
                    let (conn, rx) = handle(&format!("user-{worker}"));
                    registry.add(conn.clone());
                    if i % 2 == 0 {
                        registry.remove(conn.id());
                        // a second removal from "the hub" must be harmless
                        registry.remove(conn.id());
                    } else {
                        kept.push((conn.id(), rx));
                    }
                }
                kept.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
            }));
        }

        let mut expected = HashSet::new();
        for worker in workers {
            expected.extend(worker.join().unwrap());
        }

        let actual: HashSet<_> = registry.snapshot().iter().map(|h| h.id()).collect();
        assert_eq!(actual, expected);
        assert_eq!(registry.len(), 8 * 100);
    }

    #[test_timeout::timeout]
    fn delivery_reports_closed_and_saturated_queues() {
        let identity = Identity::new("alice").unwrap();
        let (conn, rx) = ConnectionHandle::open(identity, None, 1, &CancellationToken::new());
        let message: Outbound = Arc::new(flare_core::InboundFrame::ordinary("hi").stamp(
            conn.identity(),
            conn.id().to_string(),
            None,
            flare_core::now_timestamp(),
        ));

        assert_eq!(conn.deliver(&message), Ok(()));
        assert_eq!(conn.deliver(&message), Err(DeliveryError::Saturated));

        drop(rx);
        assert_eq!(conn.deliver(&message), Err(DeliveryError::Closed));
    }

    #[test_timeout::timeout]
    fn closing_parent_token_closes_connection() {
        let shutdown = CancellationToken::new();
        let (conn, _rx) =
            ConnectionHandle::open(Identity::new("alice").unwrap(), None, 4, &shutdown);
        assert!(!conn.is_closed());
        shutdown.cancel();
        assert!(conn.is_closed());
    }
}
