//! # Tether Protocol Library
//!
//! This crate provides protocol definitions and cryptographic primitives
//! for the Tether phone-to-desktop sync engine.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of Tether's communication layer,
//! providing:
//!
//! - **Envelope Codec**: the typed JSON message unit exchanged over the channel
//! - **Discovery Announcements**: the multicast datagram format peers find each other with
//! - **Session Crypto**: x25519 key agreement and AES-256-GCM payload encryption
//! - **Error Taxonomy**: the non-fatal failure modes of the engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Typed payload views            │  per-type structs
//! ├─────────────────────────────────────────┤
//! │            Envelope codec               │  JSON text frames
//! ├─────────────────────────────────────────┤
//! │      Session cipher (AES-256-GCM)       │  identity until paired
//! ├─────────────────────────────────────────┤
//! │      Transport (WebSocket channel)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{Envelope, MessageType, SessionCipher};
//!
//! let envelope = Envelope::empty(MessageType::Heartbeat);
//! let wire = envelope.encode().unwrap();
//! let decoded = Envelope::decode(&wire).unwrap();
//! assert_eq!(decoded, envelope);
//!
//! // Before pairing completes the cipher is an identity function.
//! let cipher = SessionCipher::Passthrough;
//! assert_eq!(cipher.seal(&wire).unwrap(), wire);
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: envelope codec, message-type registry, typed views
//! - [`announce`]: discovery datagram format
//! - [`crypto`]: key agreement and payload encryption
//! - [`error`]: error types

pub mod announce;
pub mod crypto;
pub mod envelope;
pub mod error;

pub use announce::{DiscoveredPeer, PeerAnnouncement, ANNOUNCE_VERSION, DEFAULT_CHANNEL_PORT};
pub use crypto::{
    decode_public_key, Keypair, SessionCipher, SessionKey, NONCE_LENGTH, PUBLIC_KEY_LENGTH,
    SESSION_KEY_LENGTH,
};
pub use envelope::{
    is_truthy, to_payload, CallActionPayload, ClipboardPayload, Envelope, ErrorPayload,
    FileAcceptPayload, FileOfferPayload, HeartbeatPayload, MessageType, NotificationActionPayload,
    PairingRequestPayload, PairingResponsePayload, Payload, SmsMessagesPayload, SmsSendPayload,
    TypedEnvelope, PROTOCOL_VERSION,
};
pub use error::{ProtocolError, Result};
