//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// Nothing here is fatal to the host process: every variant resolves to
/// a dropped message or a connection state transition at the call site.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Codec errors
    /// The byte stream is not a well-formed envelope, or a required
    /// field (`type`, `id`, `version`) is absent.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Failed to serialize an envelope or payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    // Cryptographic errors
    /// AEAD tag verification failed; the message is corrupted or was
    /// encrypted under a different key.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// Encryption or key derivation failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Handshake errors
    /// The peer explicitly rejected the pairing request.
    #[error("pairing rejected: {0}")]
    HandshakeRejected(String),

    // Connection errors
    /// Socket open/read/write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::MalformedEnvelope(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::MalformedEnvelope(format!("invalid base64: {err}"))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_envelope_display() {
        let err = ProtocolError::MalformedEnvelope("missing field `type`".to_string());
        assert_eq!(err.to_string(), "malformed envelope: missing field `type`");
    }

    #[test]
    fn test_auth_failure_display() {
        let err = ProtocolError::AuthFailure("tag mismatch".to_string());
        assert_eq!(err.to_string(), "authentication failure: tag mismatch");
    }

    #[test]
    fn test_handshake_rejected_display() {
        let err = ProtocolError::HandshakeRejected("bad pairing code".to_string());
        assert_eq!(err.to_string(), "pairing rejected: bad pairing code");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Transport(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
