//! Platform collaborator traits.
//!
//! The dispatcher and connection manager are platform-agnostic; everything
//! that touches device hardware or OS services (SMS database, telephony,
//! clipboard, battery) sits behind the traits in this module. A host embeds
//! the engine by supplying implementations, and the bundled no-op versions
//! keep the binary runnable on hosts without any of them.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Error raised by a platform collaborator.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PlatformError(pub String);

impl PlatformError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Read and send access to the device's SMS store.
pub trait SmsStore: Send + Sync {
    /// Lists conversation threads, most recent first.
    fn list_conversations(&self) -> PlatformResult<Value>;

    /// Lists the messages in one conversation thread.
    fn list_messages(&self, thread_id: &str) -> PlatformResult<Value>;

    /// Sends a text message to the given address.
    fn send(&self, address: &str, body: &str) -> PlatformResult<()>;
}

/// Control over the device's telephony stack.
pub trait CallControl: Send + Sync {
    /// Answers the currently ringing call.
    fn answer(&self) -> PlatformResult<()>;

    /// Rejects the currently ringing call, or hangs up an active one.
    fn reject(&self) -> PlatformResult<()>;

    /// Places an outgoing call, optionally on a specific SIM slot.
    fn dial(&self, number: &str, sim_slot: Option<u32>) -> PlatformResult<()>;

    /// Describes the installed SIM slots.
    fn sim_slots(&self) -> PlatformResult<Value>;
}

/// Write access to the device clipboard.
pub trait ClipboardSink: Send + Sync {
    fn set_text(&self, text: &str) -> PlatformResult<()>;
}

/// File transfer hooks. The bulk transfer itself runs out of band; the
/// dispatcher only coordinates offers and acceptances.
pub trait FileTransfer: Send + Sync {
    /// Starts uploading a local file the peer has accepted.
    fn upload(&self, uri: &str, file_name: &str) -> PlatformResult<()>;
}

/// Battery state readings for heartbeat replies.
pub trait PowerMonitor: Send + Sync {
    /// Current battery level in percent, or -1 when unknown.
    fn battery_level(&self) -> i32;

    fn is_charging(&self) -> bool;
}

/// The full set of collaborators the engine needs.
#[derive(Clone)]
pub struct Collaborators {
    pub sms: Arc<dyn SmsStore>,
    pub calls: Arc<dyn CallControl>,
    pub clipboard: Arc<dyn ClipboardSink>,
    pub files: Arc<dyn FileTransfer>,
    pub power: Arc<dyn PowerMonitor>,
}

impl Collaborators {
    /// Collaborators that log and report every capability as unavailable.
    pub fn noop() -> Self {
        let noop = Arc::new(NoopPlatform);
        Self {
            sms: noop.clone(),
            calls: noop.clone(),
            clipboard: noop.clone(),
            files: noop.clone(),
            power: noop,
        }
    }
}

/// Placeholder implementation for hosts without platform integrations.
///
/// Queries return empty collections, actions fail with a descriptive error,
/// and battery state reads as unknown.
pub struct NoopPlatform;

impl NoopPlatform {
    fn unavailable(&self, capability: &str) -> PlatformError {
        tracing::debug!("Platform capability not available: {}", capability);
        PlatformError::new(format!("{capability} is not available on this host"))
    }
}

impl SmsStore for NoopPlatform {
    fn list_conversations(&self) -> PlatformResult<Value> {
        Ok(Value::Array(Vec::new()))
    }

    fn list_messages(&self, _thread_id: &str) -> PlatformResult<Value> {
        Ok(Value::Array(Vec::new()))
    }

    fn send(&self, _address: &str, _body: &str) -> PlatformResult<()> {
        Err(self.unavailable("SMS sending"))
    }
}

impl CallControl for NoopPlatform {
    fn answer(&self) -> PlatformResult<()> {
        Err(self.unavailable("call answering"))
    }

    fn reject(&self) -> PlatformResult<()> {
        Err(self.unavailable("call rejection"))
    }

    fn dial(&self, _number: &str, _sim_slot: Option<u32>) -> PlatformResult<()> {
        Err(self.unavailable("dialing"))
    }

    fn sim_slots(&self) -> PlatformResult<Value> {
        Ok(Value::Array(Vec::new()))
    }
}

impl ClipboardSink for NoopPlatform {
    fn set_text(&self, _text: &str) -> PlatformResult<()> {
        Err(self.unavailable("clipboard"))
    }
}

impl FileTransfer for NoopPlatform {
    fn upload(&self, _uri: &str, _file_name: &str) -> PlatformResult<()> {
        Err(self.unavailable("file transfer"))
    }
}

impl PowerMonitor for NoopPlatform {
    fn battery_level(&self) -> i32 {
        -1
    }

    fn is_charging(&self) -> bool {
        false
    }
}
