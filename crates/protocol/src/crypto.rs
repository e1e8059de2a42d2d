//! Session key agreement and payload encryption.
//!
//! Each side generates an ephemeral x25519 keypair and exchanges public
//! keys inside the pairing handshake. Both then derive the identical
//! 32-byte session key (ECDH shared secret hashed with SHA-256) without
//! the key ever crossing the wire. Post-handshake payloads are sealed
//! with AES-256-GCM; the 12-byte nonce is freshly random per call and
//! prepended to the ciphertext, and the whole blob travels base64.
//!
//! The handshake envelopes themselves travel unencrypted: the pairing
//! code is an authorization token, not a cipher key. Until a session
//! key is established [`SessionCipher`] is an identity function.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};

/// Length of an encoded x25519 public key.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a derived session key (AES-256).
pub const SESSION_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length prepended to each ciphertext blob.
pub const NONCE_LENGTH: usize = 12;

/// An ephemeral keypair for one pairing session.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generates a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The encoded public key for transmission.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// The public key as base64 for JSON payloads.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// Derives the shared session key from the peer's public key.
    ///
    /// Both sides compute the same key: SHA-256 over the raw ECDH
    /// shared secret.
    pub fn derive_session_key(&self, peer_public: &[u8; PUBLIC_KEY_LENGTH]) -> SessionKey {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        let digest = Sha256::digest(shared.as_bytes());
        let mut key = [0u8; SESSION_KEY_LENGTH];
        key.copy_from_slice(&digest);
        SessionKey(key)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &BASE64.encode(self.public_key_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Decodes a base64-encoded peer public key.
pub fn decode_public_key(encoded: &str) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
    if bytes.len() != PUBLIC_KEY_LENGTH {
        return Err(ProtocolError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LENGTH,
            bytes.len()
        )));
    }
    let mut key = [0u8; PUBLIC_KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// A derived symmetric session key.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Authenticated encryption for channel payloads.
///
/// `Passthrough` is the pre-handshake identity mode; `Keyed` seals and
/// opens AES-256-GCM blobs. `open` fails closed: a tag mismatch or a
/// short blob returns [`ProtocolError::AuthFailure`], never partial
/// plaintext.
#[derive(Clone)]
pub enum SessionCipher {
    Passthrough,
    Keyed(SessionKey),
}

impl SessionCipher {
    /// Whether a session key has been established.
    pub fn is_keyed(&self) -> bool {
        matches!(self, SessionCipher::Keyed(_))
    }

    /// Encrypts a payload string. Identity when unkeyed.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let key = match self {
            SessionCipher::Passthrough => return Ok(plaintext.to_string()),
            SessionCipher::Keyed(key) => key,
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| ProtocolError::CryptoFailure(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypts a payload blob. Identity when unkeyed.
    pub fn open(&self, blob: &str) -> Result<String> {
        let key = match self {
            SessionCipher::Passthrough => return Ok(blob.to_string()),
            SessionCipher::Keyed(key) => key,
        };

        let bytes = BASE64
            .decode(blob.trim())
            .map_err(|e| ProtocolError::AuthFailure(format!("invalid blob encoding: {e}")))?;
        if bytes.len() < NONCE_LENGTH {
            return Err(ProtocolError::AuthFailure(format!(
                "blob too short: {} bytes",
                bytes.len()
            )));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::AuthFailure("AEAD tag verification failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| ProtocolError::AuthFailure(format!("invalid plaintext utf-8: {e}")))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCipher::Passthrough => f.write_str("SessionCipher::Passthrough"),
            SessionCipher::Keyed(_) => f.write_str("SessionCipher::Keyed([REDACTED])"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation_produces_unique_keys() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_both_sides_derive_identical_key() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let alice_key = alice.derive_session_key(&bob.public_key_bytes());
        let bob_key = bob.derive_session_key(&alice.public_key_bytes());

        assert_eq!(alice_key, bob_key);
    }

    #[test]
    fn test_different_peers_derive_different_keys() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let carol = Keypair::generate();

        let with_bob = alice.derive_session_key(&bob.public_key_bytes());
        let with_carol = alice.derive_session_key(&carol.public_key_bytes());

        assert_ne!(with_bob, with_carol);
    }

    #[test]
    fn test_public_key_base64_round_trip() {
        let keypair = Keypair::generate();
        let decoded = decode_public_key(&keypair.public_key_base64()).unwrap();
        assert_eq!(decoded, keypair.public_key_bytes());
    }

    #[test]
    fn test_decode_public_key_rejects_bad_input() {
        assert!(matches!(
            decode_public_key("not base64 !!!"),
            Err(ProtocolError::InvalidPublicKey(_))
        ));
        // Valid base64, wrong length.
        assert!(matches!(
            decode_public_key(&BASE64.encode([0u8; 16])),
            Err(ProtocolError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_seal_open_round_trip() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let cipher = SessionCipher::Keyed(alice.derive_session_key(&bob.public_key_bytes()));

        for message in ["", "short", "a longer message with unicode: héllo ✓"] {
            let blob = cipher.seal(message).unwrap();
            assert_ne!(blob, message);
            assert_eq!(cipher.open(&blob).unwrap(), message);
        }
    }

    #[test]
    fn test_seal_uses_fresh_nonce_per_call() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_LENGTH]);
        let cipher = SessionCipher::Keyed(key);
        let a = cipher.seal("same plaintext").unwrap();
        let b = cipher.seal("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_with_wrong_key_fails_closed() {
        let sealer = SessionCipher::Keyed(SessionKey::from_bytes([1u8; SESSION_KEY_LENGTH]));
        let opener = SessionCipher::Keyed(SessionKey::from_bytes([2u8; SESSION_KEY_LENGTH]));

        let blob = sealer.seal("secret").unwrap();
        assert!(matches!(
            opener.open(&blob),
            Err(ProtocolError::AuthFailure(_))
        ));
    }

    #[test]
    fn test_open_corrupted_blob_fails_closed() {
        let cipher = SessionCipher::Keyed(SessionKey::from_bytes([1u8; SESSION_KEY_LENGTH]));
        let blob = cipher.seal("secret").unwrap();

        let mut bytes = BASE64.decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let corrupted = BASE64.encode(bytes);

        assert!(matches!(
            cipher.open(&corrupted),
            Err(ProtocolError::AuthFailure(_))
        ));
    }

    #[test]
    fn test_open_short_blob_fails_closed() {
        let cipher = SessionCipher::Keyed(SessionKey::from_bytes([1u8; SESSION_KEY_LENGTH]));
        let short = BASE64.encode([0u8; NONCE_LENGTH - 1]);
        assert!(matches!(
            cipher.open(&short),
            Err(ProtocolError::AuthFailure(_))
        ));
    }

    #[test]
    fn test_passthrough_is_identity() {
        let cipher = SessionCipher::Passthrough;
        assert!(!cipher.is_keyed());
        assert_eq!(cipher.seal("plain").unwrap(), "plain");
        assert_eq!(cipher.open("plain").unwrap(), "plain");
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let keypair = Keypair::generate();
        let debug = format!("{keypair:?}");
        assert!(debug.contains("REDACTED"));

        let cipher = SessionCipher::Keyed(SessionKey::from_bytes([9u8; SESSION_KEY_LENGTH]));
        assert!(format!("{cipher:?}").contains("REDACTED"));
    }
}
