//! Connection registry for Beacon.
//!
//! The registry is the authoritative map from a user identity to the set of
//! live connections that can reach it. Sessions own their connection; the
//! registry only holds cheap handle clones. All mutations for one user are
//! linearized under that user's map entry, so the 0→1 and 1→0 presence
//! transitions are detected exactly once no matter how many devices race.

use beacon_protocol::ServerFrame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// A user identity, as resolved by the auth validator.
pub type UserId = String;

/// Consecutive failed deliveries before a connection is force-closed.
const DEFAULT_STRIKE_LIMIT: u32 = 3;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The handle's connection ID is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),
}

/// Delivery errors for a single connection handle.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection is closed; the frame was dropped.
    #[error("Connection closed")]
    Closed,

    /// The outbound queue is full; the frame was dropped.
    #[error("Outbound queue full")]
    Backlogged,
}

/// A presence transition observed by a registry mutation.
///
/// Returned to the caller rather than signaled through a callback, so the
/// broadcast always happens after the mutation is visible to `lookup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    /// The user's first connection registered (0→1).
    Online(UserId),
    /// The user's last connection unregistered (1→0).
    Offline(UserId),
}

impl PresenceTransition {
    /// The subject user of this transition.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        match self {
            PresenceTransition::Online(user) | PresenceTransition::Offline(user) => user,
        }
    }
}

/// Shared handle state, visible to every clone.
#[derive(Debug)]
struct HandleShared {
    closed: AtomicBool,
    strikes: AtomicU32,
    strike_limit: u32,
    shutdown: Notify,
}

/// A live connection's delivery handle.
///
/// The owning session holds the receiver half of the outbound channel and
/// the socket itself; everything else (registry, router, broadcasters) works
/// through clones of this handle. Sends never block: a frame either fits the
/// bounded outbound queue or is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    created_at: u64,
    outbound: mpsc::Sender<ServerFrame>,
    shared: Arc<HandleShared>,
}

impl ConnectionHandle {
    /// Create a handle for a freshly authenticated connection.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, outbound: mpsc::Sender<ServerFrame>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;

        Self {
            id: ConnectionId::generate(),
            user_id: user_id.into(),
            created_at,
            outbound,
            shared: Arc::new(HandleShared {
                closed: AtomicBool::new(false),
                strikes: AtomicU32::new(0),
                strike_limit: DEFAULT_STRIKE_LIMIT,
                shutdown: Notify::new(),
            }),
        }
    }

    /// Override the consecutive-failure limit before force-close.
    #[must_use]
    pub fn with_strike_limit(mut self, limit: u32) -> Self {
        self.shared = Arc::new(HandleShared {
            closed: AtomicBool::new(false),
            strikes: AtomicU32::new(0),
            strike_limit: limit.max(1),
            shutdown: Notify::new(),
        });
        self
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the owning user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Creation timestamp (epoch milliseconds).
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Deliver a frame that matters (messages, acks).
    ///
    /// Repeated consecutive failures against a full queue mark the consumer
    /// as too slow and force-close the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame was dropped; the caller decides whether
    /// that is worth reporting.
    pub fn deliver(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }

        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.shared.strikes.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let strikes = self.shared.strikes.fetch_add(1, Ordering::Relaxed) + 1;
                if strikes >= self.shared.strike_limit {
                    debug!(connection = %self.id, strikes, "Slow consumer, closing connection");
                    self.force_close();
                }
                Err(DeliveryError::Backlogged)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.force_close();
                Err(DeliveryError::Closed)
            }
        }
    }

    /// Deliver an ephemeral frame (typing, presence).
    ///
    /// Dropped silently under backpressure, without counting strikes.
    /// Returns `true` if the frame was enqueued.
    pub fn deliver_lossy(&self, frame: ServerFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(connection = %self.id, "Dropped ephemeral frame under backpressure");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.force_close();
                false
            }
        }
    }

    /// Mark the connection closed and wake the owning session.
    pub fn force_close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.shutdown.notify_one();
        }
    }

    /// Check whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait until the connection is force-closed.
    ///
    /// Used by the owning session inside its select loop.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.shutdown.notified().await;
    }
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration {
    /// The registered connection's ID.
    pub connection_id: ConnectionId,
    /// Set when this registration brought the user online.
    pub transition: Option<PresenceTransition>,
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of users with at least one live connection.
    pub user_count: usize,
    /// Total number of live connections.
    pub connection_count: usize,
}

/// The connection registry.
///
/// Backed by sharded maps; operations on different users do not contend,
/// operations on the same user serialize on that user's entry.
#[derive(Debug, Default)]
pub struct Registry {
    /// User identity to live connection handles.
    users: DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    /// Reverse index: connection ID to owning user.
    owners: DashMap<ConnectionId, UserId>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection handle under its owning user.
    ///
    /// Returns the connection ID and, when this was the user's first live
    /// connection, the `Online` transition. Re-registering an already
    /// registered handle is a usage error.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle's connection ID is already registered.
    pub fn register(&self, handle: ConnectionHandle) -> Result<Registration, RegistryError> {
        let id = handle.id().clone();
        let user = handle.user_id().clone();

        match self.owners.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyRegistered(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(user.clone());
            }
        }

        let mut entry = self.users.entry(user.clone()).or_default();
        let came_online = entry.is_empty();
        entry.insert(id.clone(), handle);
        let device_count = entry.len();
        drop(entry);

        debug!(user = %user, connection = %id, devices = device_count, "Connection registered");

        Ok(Registration {
            connection_id: id,
            transition: came_online.then(|| PresenceTransition::Online(user)),
        })
    }

    /// Unregister a connection.
    ///
    /// No-op if the connection is not registered. Returns the `Offline`
    /// transition when this removal emptied the user's entry; the entry
    /// itself is deleted in the same step, under the entry lock.
    pub fn unregister(&self, id: &ConnectionId) -> Option<PresenceTransition> {
        let (_, user) = self.owners.remove(id)?;

        match self.users.entry(user) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().remove(id);
                if occupied.get().is_empty() {
                    let (user, _) = occupied.remove_entry();
                    debug!(user = %user, connection = %id, "Last connection unregistered");
                    Some(PresenceTransition::Offline(user))
                } else {
                    debug!(connection = %id, devices = occupied.get().len(), "Connection unregistered");
                    None
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Get the live handles for a user (possibly empty).
    ///
    /// Reflects the latest completed register/unregister for that user.
    #[must_use]
    pub fn lookup(&self, user: &UserId) -> Vec<ConnectionHandle> {
        self.users
            .get(user)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether a user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.contains_key(user)
    }

    /// Snapshot of every handle not owned by the given user.
    ///
    /// Used by the presence broadcaster to notify peers.
    #[must_use]
    pub fn handles_except(&self, user: &UserId) -> Vec<ConnectionHandle> {
        self.users
            .iter()
            .filter(|entry| entry.key() != user)
            .flat_map(|entry| entry.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            user_count: self.users.len(),
            connection_count: self.owners.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_for(user: &str) -> (ConnectionHandle, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(user, tx), rx)
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = Registry::new();
        let (handle, _rx) = handle_for("alice");
        let id = handle.id().clone();

        let reg = registry.register(handle).unwrap();
        assert_eq!(reg.connection_id, id);
        assert_eq!(
            reg.transition,
            Some(PresenceTransition::Online("alice".to_string()))
        );
        assert!(registry.is_online(&"alice".to_string()));
        assert_eq!(registry.lookup(&"alice".to_string()).len(), 1);

        let transition = registry.unregister(&id);
        assert_eq!(
            transition,
            Some(PresenceTransition::Offline("alice".to_string()))
        );
        assert!(!registry.is_online(&"alice".to_string()));
        assert!(registry.lookup(&"alice".to_string()).is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = Registry::new();
        let (handle, _rx) = handle_for("alice");

        registry.register(handle.clone()).unwrap();
        assert!(matches!(
            registry.register(handle),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = Registry::new();
        let (handle, _rx) = handle_for("alice");
        let id = handle.id().clone();

        registry.register(handle).unwrap();
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.unregister(&ConnectionId::from("never-registered")).is_none());
    }

    #[test]
    fn test_multi_device_transitions() {
        let registry = Registry::new();
        let (first, _rx1) = handle_for("alice");
        let (second, _rx2) = handle_for("alice");
        let first_id = first.id().clone();
        let second_id = second.id().clone();

        // Only the first device flips the user online
        assert!(registry.register(first).unwrap().transition.is_some());
        assert!(registry.register(second).unwrap().transition.is_none());
        assert_eq!(registry.lookup(&"alice".to_string()).len(), 2);

        // Only the last device flips the user offline
        assert!(registry.unregister(&first_id).is_none());
        assert_eq!(
            registry.unregister(&second_id),
            Some(PresenceTransition::Offline("alice".to_string()))
        );
    }

    #[test]
    fn test_concurrent_same_user_transitions_detected_once() {
        let registry = Arc::new(Registry::new());

        let mut rxs = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let (handle, rx) = handle_for("alice");
            rxs.push(rx);
            handles.push(handle);
        }

        let online_count: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .into_iter()
                .map(|handle| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || {
                        registry
                            .register(handle)
                            .unwrap()
                            .transition
                            .is_some() as usize
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(online_count, 1);
        assert_eq!(registry.lookup(&"alice".to_string()).len(), 5);

        let ids: Vec<ConnectionId> = registry
            .lookup(&"alice".to_string())
            .iter()
            .map(|h| h.id().clone())
            .collect();

        let offline_count: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = ids
                .iter()
                .map(|id| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || registry.unregister(id).is_some() as usize)
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(offline_count, 1);
        assert!(!registry.is_online(&"alice".to_string()));
    }

    #[test]
    fn test_presence_entry_matches_live_connections() {
        // Interleave register/unregister churn across users and check
        // invariant 1 at the end: an entry exists iff >=1 live connection.
        let registry = Arc::new(Registry::new());

        std::thread::scope(|scope| {
            for user in ["alice", "bob", "carol", "dave"] {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for round in 0..50 {
                        let (handle, _rx) = handle_for(user);
                        let id = handle.id().clone();
                        registry.register(handle).unwrap();
                        if round % 2 == 0 {
                            registry.unregister(&id);
                        } else {
                            let (extra, _rx2) = handle_for(user);
                            let extra_id = extra.id().clone();
                            registry.register(extra).unwrap();
                            registry.unregister(&extra_id);
                            registry.unregister(&id);
                        }
                    }
                });
            }
        });

        for user in ["alice", "bob", "carol", "dave"] {
            let user = user.to_string();
            assert!(!registry.is_online(&user));
            assert!(registry.lookup(&user).is_empty());
        }
        assert_eq!(registry.stats().connection_count, 0);
    }

    #[test]
    fn test_handles_except_excludes_subject() {
        let registry = Registry::new();
        let (alice, _rx1) = handle_for("alice");
        let (bob, _rx2) = handle_for("bob");
        registry.register(alice).unwrap();
        registry.register(bob).unwrap();

        let others = registry.handles_except(&"alice".to_string());
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].user_id(), "bob");
    }

    #[test]
    fn test_deliver_strikes_close_slow_consumer() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("alice", tx).with_strike_limit(2);

        // First frame fills the queue
        handle
            .deliver(ServerFrame::error("fill"))
            .unwrap();

        assert!(matches!(
            handle.deliver(ServerFrame::error("one")),
            Err(DeliveryError::Backlogged)
        ));
        assert!(!handle.is_closed());

        assert!(matches!(
            handle.deliver(ServerFrame::error("two")),
            Err(DeliveryError::Backlogged)
        ));
        assert!(handle.is_closed());

        // Closed handles drop frames silently
        assert!(matches!(
            handle.deliver(ServerFrame::error("three")),
            Err(DeliveryError::Closed)
        ));
    }

    #[test]
    fn test_deliver_lossy_drops_without_strikes() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("alice", tx).with_strike_limit(1);

        assert!(handle.deliver_lossy(ServerFrame::presence("bob", true)));
        // Queue full: dropped, but the connection stays open
        assert!(!handle.deliver_lossy(ServerFrame::presence("bob", false)));
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("alice", tx);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };

        handle.force_close();
        waiter.await.unwrap();
        assert!(handle.is_closed());
    }
}
