//! Typing indicator relay for Beacon.
//!
//! Typing signals are ephemeral: no retry, no queue, dropped freely under
//! backpressure. Rapid keystroke-driven repeats of the same signal are
//! coalesced per (sender, recipient) pair so a fast typist cannot flood a
//! peer. A state flip (start→stop or stop→start) is never coalesced.

use crate::registry::{Registry, UserId};
use beacon_protocol::ServerFrame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default coalescing window for repeated identical signals.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(1);

/// Outcome of relaying one typing signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded to this many of the recipient's connections.
    Delivered(usize),
    /// Suppressed: identical signal inside the coalescing window.
    Coalesced,
    /// The recipient has no live connection; signal discarded.
    RecipientOffline,
}

impl RelayOutcome {
    /// Whether the signal reached the recipient.
    #[must_use]
    pub fn delivered(&self) -> bool {
        matches!(self, RelayOutcome::Delivered(_))
    }
}

/// Last emitted signal per (sender, recipient) pair.
#[derive(Debug)]
struct TypingMark {
    is_typing: bool,
    emitted_at: Instant,
}

/// The typing indicator relay.
#[derive(Debug)]
pub struct TypingRelay {
    registry: Arc<Registry>,
    marks: DashMap<(UserId, UserId), TypingMark>,
    window: Duration,
}

impl TypingRelay {
    /// Create a relay with the default coalescing window.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_window(registry, DEFAULT_COALESCE_WINDOW)
    }

    /// Create a relay with a custom coalescing window.
    #[must_use]
    pub fn with_window(registry: Arc<Registry>, window: Duration) -> Self {
        Self {
            registry,
            marks: DashMap::new(),
            window,
        }
    }

    /// Relay a typing signal to all of the recipient's live connections.
    pub fn relay(&self, sender: &UserId, recipient: &UserId, is_typing: bool) -> RelayOutcome {
        self.relay_at(sender, recipient, is_typing, Instant::now())
    }

    fn relay_at(
        &self,
        sender: &UserId,
        recipient: &UserId,
        is_typing: bool,
        now: Instant,
    ) -> RelayOutcome {
        match self.marks.entry((sender.clone(), recipient.clone())) {
            Entry::Occupied(mut occupied) => {
                let mark = occupied.get();
                if mark.is_typing == is_typing
                    && now.duration_since(mark.emitted_at) < self.window
                {
                    trace!(sender = %sender, recipient = %recipient, "Typing signal coalesced");
                    return RelayOutcome::Coalesced;
                }

                let handles = self.registry.lookup(recipient);
                if handles.is_empty() {
                    occupied.remove();
                    return RelayOutcome::RecipientOffline;
                }

                let frame = ServerFrame::typing(sender.clone(), is_typing);
                let delivered = handles
                    .iter()
                    .filter(|handle| handle.deliver_lossy(frame.clone()))
                    .count();
                occupied.insert(TypingMark {
                    is_typing,
                    emitted_at: now,
                });
                RelayOutcome::Delivered(delivered)
            }
            Entry::Vacant(vacant) => {
                let handles = self.registry.lookup(recipient);
                if handles.is_empty() {
                    return RelayOutcome::RecipientOffline;
                }

                let frame = ServerFrame::typing(sender.clone(), is_typing);
                let delivered = handles
                    .iter()
                    .filter(|handle| handle.deliver_lossy(frame.clone()))
                    .count();
                vacant.insert(TypingMark {
                    is_typing,
                    emitted_at: now,
                });
                RelayOutcome::Delivered(delivered)
            }
        }
    }

    /// Drop all marks targeting a recipient that went offline.
    pub fn forget_recipient(&self, user: &UserId) {
        self.marks.retain(|key, _| key.1 != *user);
    }

    /// Purge marks idle for longer than `idle_after`.
    ///
    /// Returns the number of marks removed.
    pub fn sweep(&self, idle_after: Duration) -> usize {
        self.sweep_at(Instant::now(), idle_after)
    }

    fn sweep_at(&self, now: Instant, idle_after: Duration) -> usize {
        let before = self.marks.len();
        self.marks
            .retain(|_, mark| now.duration_since(mark.emitted_at) <= idle_after);
        before - self.marks.len()
    }

    /// Number of tracked (sender, recipient) pairs.
    #[must_use]
    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }

    /// Periodic sweep loop; spawn as a background task.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, idle_after: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = self.sweep(idle_after);
            if purged > 0 {
                debug!(purged, "Swept idle typing marks");
            }
        }
    }
}
