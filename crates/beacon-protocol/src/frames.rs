//! Frame types for the Beacon protocol.
//!
//! Frames are the unit of communication between clients and the relay.
//! Inbound and outbound directions use separate enums: clients only ever
//! produce [`ClientFrame`]s and only ever consume [`ServerFrame`]s.
//! Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// A `connect` frame carrying a different version is rejected before
/// authentication.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames sent by clients to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Initial handshake. Must be the first frame on a connection.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version the client speaks.
        version: u8,
        /// Opaque credential, resolved by the auth validator.
        credential: String,
    },

    /// Send a point-to-point message to another user.
    #[serde(rename = "message.send")]
    MessageSend {
        /// Recipient user id.
        to: String,
        /// Message content.
        content: String,
    },

    /// The sender started typing towards a peer.
    #[serde(rename = "typing.start")]
    TypingStart {
        /// Recipient user id.
        to: String,
    },

    /// The sender stopped typing towards a peer.
    #[serde(rename = "typing.stop")]
    TypingStop {
        /// Recipient user id.
        to: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp, echoed back in the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Explicit clean logout.
    #[serde(rename = "logout")]
    Logout,
}

impl ClientFrame {
    /// Event name of this frame, for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "connect",
            ClientFrame::MessageSend { .. } => "message.send",
            ClientFrame::TypingStart { .. } => "typing.start",
            ClientFrame::TypingStop { .. } => "typing.stop",
            ClientFrame::Ping { .. } => "ping",
            ClientFrame::Logout => "logout",
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, credential: impl Into<String>) -> Self {
        ClientFrame::Connect {
            version,
            credential: credential.into(),
        }
    }

    /// Create a new MessageSend frame.
    #[must_use]
    pub fn message_send(to: impl Into<String>, content: impl Into<String>) -> Self {
        ClientFrame::MessageSend {
            to: to.into(),
            content: content.into(),
        }
    }

    /// Create a typing frame for the given state.
    #[must_use]
    pub fn typing(to: impl Into<String>, is_typing: bool) -> Self {
        if is_typing {
            ClientFrame::TypingStart { to: to.into() }
        } else {
            ClientFrame::TypingStop { to: to.into() }
        }
    }
}

/// Frames sent by the relay to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake accepted, connection is live.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A user transitioned to online (first live connection).
    #[serde(rename = "user.online")]
    UserOnline {
        /// Subject user id.
        user_id: String,
    },

    /// A user transitioned to offline (last live connection gone).
    #[serde(rename = "user.offline")]
    UserOffline {
        /// Subject user id.
        user_id: String,
    },

    /// Acknowledgment to the sender that a message was dispatched.
    #[serde(rename = "message.sent")]
    MessageSent {
        /// Sender user id.
        from: String,
        /// Message content.
        content: String,
        /// Server-assigned timestamp (epoch milliseconds).
        timestamp: u64,
    },

    /// An inbound message for this connection's user.
    #[serde(rename = "message.received")]
    MessageReceived {
        /// Sender user id.
        from: String,
        /// Message content.
        content: String,
        /// Server-assigned timestamp (epoch milliseconds).
        timestamp: u64,
    },

    /// Non-delivery acknowledgment: the recipient has no live connection.
    #[serde(rename = "message.undelivered")]
    Undelivered {
        /// Intended recipient user id.
        to: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A peer started typing towards this connection's user.
    #[serde(rename = "typing.start")]
    TypingStart {
        /// Typing user id.
        from: String,
    },

    /// A peer stopped typing towards this connection's user.
    #[serde(rename = "typing.stop")]
    TypingStop {
        /// Typing user id.
        from: String,
    },

    /// The sender was throttled; the message was dropped.
    #[serde(rename = "rate.limited")]
    RateLimited {
        /// Human-readable message.
        message: String,
    },

    /// Validation or authentication failure.
    #[serde(rename = "error")]
    Error {
        /// Human-readable reason.
        reason: String,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Event name of this frame, for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::UserOnline { .. } => "user.online",
            ServerFrame::UserOffline { .. } => "user.offline",
            ServerFrame::MessageSent { .. } => "message.sent",
            ServerFrame::MessageReceived { .. } => "message.received",
            ServerFrame::Undelivered { .. } => "message.undelivered",
            ServerFrame::TypingStart { .. } => "typing.start",
            ServerFrame::TypingStop { .. } => "typing.stop",
            ServerFrame::RateLimited { .. } => "rate.limited",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerFrame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a presence frame for the given transition direction.
    #[must_use]
    pub fn presence(user_id: impl Into<String>, online: bool) -> Self {
        if online {
            ServerFrame::UserOnline {
                user_id: user_id.into(),
            }
        } else {
            ServerFrame::UserOffline {
                user_id: user_id.into(),
            }
        }
    }

    /// Create a typing frame for the given state.
    #[must_use]
    pub fn typing(from: impl Into<String>, is_typing: bool) -> Self {
        if is_typing {
            ServerFrame::TypingStart { from: from.into() }
        } else {
            ServerFrame::TypingStop { from: from.into() }
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        ServerFrame::Error {
            reason: reason.into(),
        }
    }

    /// Create a new RateLimited frame.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        ServerFrame::RateLimited {
            message: message.into(),
        }
    }

    /// Create a new Undelivered frame.
    #[must_use]
    pub fn undelivered(to: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerFrame::Undelivered {
            to: to.into(),
            reason: reason.into(),
        }
    }
}
