//! Presence broadcasting for Beacon.
//!
//! The broadcaster turns registry transitions into `user.online` /
//! `user.offline` notifications for every connection except the subject's
//! own. It only ever acts on a [`PresenceTransition`] value returned by a
//! completed registry mutation, so the announced state is always queryable
//! through `lookup` before any peer observes the event.

use crate::registry::{PresenceTransition, Registry};
use beacon_protocol::ServerFrame;
use std::sync::Arc;
use tracing::debug;

/// Fans presence transitions out to online peers.
#[derive(Debug)]
pub struct PresenceBroadcaster {
    registry: Arc<Registry>,
}

impl PresenceBroadcaster {
    /// Create a broadcaster over the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Broadcast one transition to every connection of every other user.
    ///
    /// Delivery is lossy; a peer with a full outbound queue misses the
    /// notification rather than blocking the broadcast.
    ///
    /// Returns the number of connections notified.
    pub fn announce(&self, transition: &PresenceTransition) -> usize {
        let (user, online) = match transition {
            PresenceTransition::Online(user) => (user, true),
            PresenceTransition::Offline(user) => (user, false),
        };

        let frame = ServerFrame::presence(user.clone(), online);
        let mut notified = 0;
        for handle in self.registry.handles_except(user) {
            if handle.deliver_lossy(frame.clone()) {
                notified += 1;
            }
        }

        debug!(user = %user, online, notified, "Presence broadcast");
        notified
    }
}
