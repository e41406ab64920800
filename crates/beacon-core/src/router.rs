//! Point-to-point message router for Beacon.
//!
//! The router validates a send, runs it past the rate limiter, resolves the
//! recipient through the registry, and fans the envelope out to every live
//! device. The sender's own connection gets a `message.sent` ack carrying
//! the same server-assigned timestamp the recipients see. Nothing is ever
//! persisted or retried.

use crate::ratelimit::RateLimiter;
use crate::registry::{ConnectionHandle, ConnectionId, Registry, UserId};
use beacon_protocol::ServerFrame;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

/// Router errors.
///
/// Each variant maps to a frame the session sends back to the offending
/// connection; none of them disturb other connections.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Recipient id missing from the send.
    #[error("Recipient must not be empty")]
    EmptyRecipient,

    /// Message content missing from the send.
    #[error("Message content must not be empty")]
    EmptyContent,

    /// Message content above the configured limit.
    #[error("Message content exceeds {0} bytes")]
    ContentTooLarge(usize),

    /// The sender is throttled; the message was dropped.
    #[error("Rate limit exceeded")]
    RateLimited,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum message content size in bytes.
    pub max_content_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 64 * 1024,
        }
    }
}

/// A message in flight through one routing call. Never persisted.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Sending user.
    pub sender: UserId,
    /// Target user.
    pub recipient: UserId,
    /// Message content.
    pub content: String,
    /// Server-assigned timestamp (epoch milliseconds).
    pub created_at: u64,
}

impl MessageEnvelope {
    /// Create an envelope with a server-assigned timestamp.
    #[must_use]
    pub fn new(sender: UserId, recipient: UserId, content: String) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        Self {
            sender,
            recipient,
            content,
            created_at,
        }
    }
}

/// Outcome of a routing call that passed validation and throttling.
#[derive(Debug, Clone)]
pub struct RouteReceipt {
    /// Whether the recipient was reachable.
    pub delivered: bool,
    /// Connections the envelope was dispatched to.
    pub targets: Vec<ConnectionId>,
}

/// The message router.
pub struct MessageRouter {
    registry: Arc<Registry>,
    limiter: Arc<RateLimiter>,
    config: RouterConfig,
}

impl MessageRouter {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(registry: Arc<Registry>, limiter: Arc<RateLimiter>) -> Self {
        Self::with_config(registry, limiter, RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(
        registry: Arc<Registry>,
        limiter: Arc<RateLimiter>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            limiter,
            config,
        }
    }

    /// Route one message from the origin connection to a recipient.
    ///
    /// An unreachable recipient is not an error: the origin receives a
    /// `message.undelivered` ack and the receipt reports `delivered: false`.
    ///
    /// # Errors
    ///
    /// Returns an error on validation failure or throttling; nothing is
    /// dispatched in either case.
    pub fn route(
        &self,
        origin: &ConnectionHandle,
        recipient: &str,
        content: &str,
    ) -> Result<RouteReceipt, RouteError> {
        if recipient.is_empty() {
            return Err(RouteError::EmptyRecipient);
        }
        if content.is_empty() {
            return Err(RouteError::EmptyContent);
        }
        if content.len() > self.config.max_content_bytes {
            return Err(RouteError::ContentTooLarge(self.config.max_content_bytes));
        }

        let sender = origin.user_id();
        if !self.limiter.allow(sender) {
            debug!(sender = %sender, "Send throttled");
            return Err(RouteError::RateLimited);
        }

        let envelope = MessageEnvelope::new(
            sender.clone(),
            recipient.to_string(),
            content.to_string(),
        );

        let handles = self.registry.lookup(&envelope.recipient);
        if handles.is_empty() {
            debug!(sender = %sender, recipient = %envelope.recipient, "Recipient offline");
            let _ = origin.deliver(ServerFrame::undelivered(
                envelope.recipient,
                "recipient offline",
            ));
            return Ok(RouteReceipt {
                delivered: false,
                targets: Vec::new(),
            });
        }

        let received = ServerFrame::MessageReceived {
            from: envelope.sender.clone(),
            content: envelope.content.clone(),
            timestamp: envelope.created_at,
        };

        let mut targets = Vec::with_capacity(handles.len());
        for handle in &handles {
            targets.push(handle.id().clone());
            if let Err(e) = handle.deliver(received.clone()) {
                // A closing or backlogged target drops the frame; no retry
                trace!(connection = %handle.id(), error = %e, "Delivery dropped");
            }
        }

        let _ = origin.deliver(ServerFrame::MessageSent {
            from: envelope.sender,
            content: envelope.content,
            timestamp: envelope.created_at,
        });

        trace!(
            origin = %origin.id(),
            recipient = %recipient,
            devices = targets.len(),
            "Message routed"
        );

        Ok(RouteReceipt {
            delivered: true,
            targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiterConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<Registry>, MessageRouter) {
        let registry = Arc::new(Registry::new());
        let limiter = Arc::new(RateLimiter::new());
        let router = MessageRouter::new(Arc::clone(&registry), limiter);
        (registry, router)
    }

    fn connect(
        registry: &Registry,
        user: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(user, tx);
        registry.register(handle.clone()).unwrap();
        (handle, rx)
    }

    #[test]
    fn test_validation_rejects_empty_fields() {
        let (registry, router) = setup();
        let (alice, _rx) = connect(&registry, "alice");

        assert!(matches!(
            router.route(&alice, "", "hi"),
            Err(RouteError::EmptyRecipient)
        ));
        assert!(matches!(
            router.route(&alice, "bob", ""),
            Err(RouteError::EmptyContent)
        ));
    }

    #[test]
    fn test_content_size_limit() {
        let registry = Arc::new(Registry::new());
        let limiter = Arc::new(RateLimiter::new());
        let router = MessageRouter::with_config(
            Arc::clone(&registry),
            limiter,
            RouterConfig {
                max_content_bytes: 8,
            },
        );
        let (alice, _rx) = connect(&registry, "alice");

        assert!(matches!(
            router.route(&alice, "bob", "way past the limit"),
            Err(RouteError::ContentTooLarge(8))
        ));
    }

    #[test]
    fn test_offline_recipient_acked_not_delivered() {
        let (registry, router) = setup();
        let (alice, mut alice_rx) = connect(&registry, "alice");

        let receipt = router.route(&alice, "bob", "hi").unwrap();
        assert!(!receipt.delivered);
        assert!(receipt.targets.is_empty());

        // Sender gets the non-delivery ack; nobody gets message.received
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            ServerFrame::undelivered("bob", "recipient offline")
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_multi_device_fanout_single_ack() {
        let (registry, router) = setup();
        let (alice, mut alice_rx) = connect(&registry, "alice");
        let (_bob1, mut bob_rx1) = connect(&registry, "bob");
        let (_bob2, mut bob_rx2) = connect(&registry, "bob");

        let receipt = router.route(&alice, "bob", "hi").unwrap();
        assert!(receipt.delivered);
        assert_eq!(receipt.targets.len(), 2);

        // Both of bob's devices receive, alice gets exactly one ack
        assert!(matches!(
            bob_rx1.try_recv().unwrap(),
            ServerFrame::MessageReceived { .. }
        ));
        assert!(matches!(
            bob_rx2.try_recv().unwrap(),
            ServerFrame::MessageReceived { .. }
        ));
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerFrame::MessageSent { .. }
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_roundtrip_shares_timestamp() {
        let (registry, router) = setup();
        let (alice, mut alice_rx) = connect(&registry, "alice");
        let (_bob, mut bob_rx) = connect(&registry, "bob");

        router.route(&alice, "bob", "hi").unwrap();

        let received = bob_rx.try_recv().unwrap();
        let sent = alice_rx.try_recv().unwrap();

        match (received, sent) {
            (
                ServerFrame::MessageReceived {
                    from: r_from,
                    content: r_content,
                    timestamp: r_ts,
                },
                ServerFrame::MessageSent {
                    from: s_from,
                    content: s_content,
                    timestamp: s_ts,
                },
            ) => {
                assert_eq!(r_from, "alice");
                assert_eq!(s_from, "alice");
                assert_eq!(r_content, "hi");
                assert_eq!(s_content, "hi");
                assert_eq!(r_ts, s_ts);
            }
            other => panic!("Unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn test_rate_limited_send_dropped() {
        let registry = Arc::new(Registry::new());
        let limiter = Arc::new(RateLimiter::with_config(RateLimiterConfig {
            capacity: 1,
            window: Duration::from_secs(60),
        }));
        let router = MessageRouter::new(Arc::clone(&registry), limiter);

        let (alice, mut alice_rx) = connect(&registry, "alice");
        let (_bob, mut bob_rx) = connect(&registry, "bob");

        router.route(&alice, "bob", "first").unwrap();
        assert!(matches!(
            router.route(&alice, "bob", "second"),
            Err(RouteError::RateLimited)
        ));

        // The throttled message reached nobody
        assert!(bob_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerFrame::MessageSent { .. }
        ));
        assert!(alice_rx.try_recv().is_err());
    }
}
