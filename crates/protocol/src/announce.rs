//! Discovery announcement wire format.
//!
//! Peers find each other by broadcasting one JSON datagram per
//! announcement on the shared multicast group:
//!
//! ```json
//! {"alias":"Pixel 8","version":"1.0","deviceModel":"Pixel 8","deviceType":"mobile",
//!  "fingerprint":"...","port":8765,"protocol":"ws","announce":true}
//! ```
//!
//! The sender's IP is never carried in the datagram; the receiver fills
//! it in from the datagram source address.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Announcement protocol revision carried in the `version` field.
pub const ANNOUNCE_VERSION: &str = "1.0";

/// Default channel port advertised when a datagram omits `port`.
pub const DEFAULT_CHANNEL_PORT: u16 = 8765;

/// A peer-announcement datagram body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    /// Human-readable device name.
    pub alias: String,
    /// Announcement format revision.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub device_model: Option<String>,
    /// `mobile`, `desktop`, or `unknown`.
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Stable opaque identity of the sending install.
    pub fingerprint: String,
    /// Channel port the sender listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Channel transport tag.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// `true` for periodic broadcasts, `false` for direct responses.
    #[serde(default)]
    pub announce: bool,
}

fn default_version() -> String {
    ANNOUNCE_VERSION.to_string()
}

fn default_device_type() -> String {
    "unknown".to_string()
}

fn default_port() -> u16 {
    DEFAULT_CHANNEL_PORT
}

fn default_protocol() -> String {
    "ws".to_string()
}

impl PeerAnnouncement {
    /// Serializes the announcement for a UDP datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parses a datagram body. Lenient: optional fields default, but a
    /// missing `alias` or `fingerprint` is a parse error (the service
    /// swallows those datagrams).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(ProtocolError::from)
    }
}

/// An announcement paired with the sender address it arrived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub announcement: PeerAnnouncement,
    /// Sender IP, filled in by the receiver from the datagram source.
    pub host: String,
}

impl DiscoveredPeer {
    pub fn new(announcement: PeerAnnouncement, host: impl Into<String>) -> Self {
        Self {
            announcement,
            host: host.into(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.announcement.fingerprint
    }

    pub fn port(&self) -> u16 {
        self.announcement.port
    }
}

impl std::fmt::Display for DiscoveredPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) at {}:{}",
            self.announcement.alias, self.announcement.device_type, self.host, self.announcement.port
        )
    }
}
