//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon realtime relay.
//!
//! This crate defines the binary protocol spoken between Beacon clients
//! and servers: frame types for both directions and the length-prefixed
//! MessagePack codec.
//!
//! ## Frame Types
//!
//! - `connect` / `connected` - Handshake and authentication
//! - `message.send` / `message.sent` / `message.received` - Point-to-point messages
//! - `typing.start` / `typing.stop` - Typing indicators
//! - `user.online` / `user.offline` - Presence transitions
//! - `rate.limited` / `error` - Throttling and failures
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ClientFrame, PROTOCOL_VERSION};
//!
//! let frame = ClientFrame::message_send("bob", "Hello, world!");
//!
//! // Encode and decode
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_from, encode, ProtocolError};
pub use frames::{ClientFrame, ServerFrame, PROTOCOL_VERSION};
