//! Tether agent library.
//!
//! The agent is the engine of a phone/desktop sync pair: it finds peers on
//! the local network, performs the pairing handshake, keeps a WebSocket
//! sync channel alive, and routes typed protocol messages to platform
//! collaborators.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +--------------------+
//! | DiscoveryService |     | ConnectionManager  |
//! |  UDP multicast   |     |  WebSocket channel |
//! +--------+---------+     +---+------------+---+
//!          |                   |            |
//!     DiscoveredPeer      StateSnapshot  MessageDispatcher
//!          |                   |            |
//!          v                   v            v
//!        CLI / host      ConnectionHandle  platform collaborators
//! ```
//!
//! Hosts embed the engine by implementing the traits in [`platform`] and
//! driving a [`connection::ConnectionHandle`]; the bundled binary wires
//! everything to no-op collaborators for bench testing against a desktop
//! peer.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatcher;
pub mod pairing;
pub mod platform;

pub use config::{Config, ConfigError};
pub use connection::{
    reconnect_delay, ChannelConfig, ConnectTarget, ConnectionHandle, ConnectionManager,
    ConnectionState, StateSnapshot,
};
pub use discovery::{DiscoveryConfig, DiscoveryService};
pub use dispatcher::{DispatchError, MessageDispatcher};
pub use pairing::{LocalIdentity, PairingState, PairingStore};
pub use platform::{
    CallControl, ClipboardSink, Collaborators, FileTransfer, NoopPlatform,
    PlatformError, PlatformResult, PowerMonitor, SmsStore,
};
