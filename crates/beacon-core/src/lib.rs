//! # beacon-core
//!
//! Presence-aware message relaying for the Beacon realtime engine.
//!
//! This crate provides the concurrency-critical building blocks:
//!
//! - **Registry** - Authoritative map from user identity to live connections
//! - **PresenceBroadcaster** - Fan out online/offline transitions
//! - **MessageRouter** - Validate, throttle, and deliver point-to-point messages
//! - **RateLimiter** - Per-sender token-bucket admission control
//! - **TypingRelay** - Coalesced typing indicators
//! - **SessionState** - Per-connection lifecycle state machine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └──────┬──────┘     └──────┬──────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │ RateLimiter │     │  Presence   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! Sessions own their connection; everything else holds cheap handle
//! clones and writes to the session's bounded outbound channel.

pub mod auth;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod router;
pub mod session;
pub mod typing;

pub use auth::{AuthError, AuthValidator};
pub use presence::PresenceBroadcaster;
pub use ratelimit::{RateLimiter, RateLimiterConfig};
pub use registry::{
    ConnectionHandle, ConnectionId, DeliveryError, PresenceTransition, Registration, Registry,
    RegistryError, RegistryStats, UserId,
};
pub use router::{MessageEnvelope, MessageRouter, RouteError, RouteReceipt, RouterConfig};
pub use session::{SessionError, SessionState};
pub use typing::{RelayOutcome, TypingRelay, DEFAULT_COALESCE_WINDOW};
