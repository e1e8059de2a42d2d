//! Persistent pairing state and local device identity.
//!
//! This module stores the outcome of a successful pairing handshake so the
//! agent can reconnect to the same peer after a restart. The state persists
//! to JSON at `<data_dir>/pairing.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The persisted pairing state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PairingState {
    /// Whether a pairing handshake has completed successfully.
    pub paired: bool,
    /// Host of the last successfully paired peer.
    pub last_host: Option<String>,
    /// Sync channel port of the last successfully paired peer.
    pub last_port: u16,
    /// Stable identifier for this installation, generated on first use.
    pub device_id: Option<String>,
    /// Name reported by the paired peer.
    pub peer_name: Option<String>,
    /// Pairing code accepted by the peer.
    pub pairing_code: Option<String>,
    /// Base64-encoded public key reported by the paired peer.
    pub peer_public_key: Option<String>,
}

impl Default for PairingState {
    fn default() -> Self {
        Self {
            paired: false,
            last_host: None,
            last_port: 8765,
            device_id: None,
            peer_name: None,
            pairing_code: None,
            peer_public_key: None,
        }
    }
}

/// Thread-safe store for the pairing state.
///
/// Mutating operations persist immediately with an atomic write (write to a
/// temp file, then rename) so a crash never leaves a half-written file.
pub struct PairingStore {
    /// Path to the JSON file.
    path: PathBuf,
    state: RwLock<PairingState>,
}

impl PairingStore {
    /// Creates a store that persists to the given path.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(PairingState::default()),
        }
    }

    /// Creates a store rooted in the given data directory.
    pub fn in_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::new(data_dir.as_ref().join("pairing.json"))
    }

    /// Returns the path to the pairing state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the pairing state from the JSON file.
    ///
    /// If the file does not exist, the store keeps its default state.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!(
                "Pairing state file not found at {:?}, starting unpaired",
                self.path
            );
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read pairing state: {}", self.path.display()))?;

        let loaded: PairingState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse pairing state: {}", self.path.display()))?;

        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on pairing store"))?;
        *state = loaded;

        tracing::info!(
            "Loaded pairing state from {:?} (paired: {})",
            self.path,
            state.paired
        );
        Ok(())
    }

    /// Saves the pairing state to the JSON file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory: {}", parent.display())
            })?;
        }

        let state = self
            .state
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on pairing store"))?;

        let contents =
            serde_json::to_string_pretty(&*state).context("Failed to serialize pairing state")?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp pairing state: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp pairing state {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved pairing state to {:?}", self.path);
        Ok(())
    }

    /// Returns a snapshot of the current pairing state.
    pub fn state(&self) -> Result<PairingState> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on pairing store"))?;
        Ok(state.clone())
    }

    /// Returns this installation's stable device id, generating and
    /// persisting one on first use.
    pub fn ensure_device_id(&self) -> Result<String> {
        {
            let state = self
                .state
                .read()
                .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on pairing store"))?;
            if let Some(id) = &state.device_id {
                return Ok(id.clone());
            }
        }

        let id = Uuid::new_v4().to_string();
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on pairing store"))?;
            // Another caller may have raced us to it
            if let Some(existing) = &state.device_id {
                return Ok(existing.clone());
            }
            state.device_id = Some(id.clone());
        }
        self.save()?;

        tracing::info!("Generated new device id {}", id);
        Ok(id)
    }

    /// Records a successful pairing handshake and persists it.
    pub fn record_pairing(
        &self,
        host: &str,
        port: u16,
        peer_name: &str,
        pairing_code: &str,
        peer_public_key: Option<&str>,
    ) -> Result<()> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on pairing store"))?;
            state.paired = true;
            state.last_host = Some(host.to_string());
            state.last_port = port;
            state.peer_name = Some(peer_name.to_string());
            state.pairing_code = Some(pairing_code.to_string());
            state.peer_public_key = peer_public_key.map(|k| k.to_string());
        }
        self.save()?;

        tracing::info!("Recorded pairing with {} at {}:{}", peer_name, host, port);
        Ok(())
    }

    /// Forgets the paired peer, keeping the local device id.
    pub fn clear_pairing(&self) -> Result<()> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on pairing store"))?;
            state.paired = false;
            state.last_host = None;
            state.peer_name = None;
            state.pairing_code = None;
            state.peer_public_key = None;
        }
        self.save()?;

        tracing::info!("Cleared pairing state");
        Ok(())
    }
}

/// Identity this agent presents to peers during discovery and pairing.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Stable installation identifier, also used as the discovery fingerprint.
    pub device_id: String,
    /// Human-readable name advertised to peers.
    pub device_name: String,
    /// Hardware model string, when known.
    pub device_model: Option<String>,
    /// Device class advertised during discovery ("mobile", "desktop", ...).
    pub device_kind: String,
}

impl LocalIdentity {
    /// Builds the identity from the pairing store and configured name.
    pub fn load(store: &PairingStore, device_name: &str) -> Result<Self> {
        Ok(Self {
            device_id: store.ensure_device_id()?,
            device_name: device_name.to_string(),
            device_model: None,
            device_kind: "mobile".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> PairingStore {
        PairingStore::in_data_dir(dir.path())
    }

    #[test]
    fn test_default_state_unpaired() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let state = store.state().unwrap();
        assert!(!state.paired);
        assert_eq!(state.last_port, 8765);
        assert!(state.device_id.is_none());
    }

    #[test]
    fn test_load_missing_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.load().unwrap();
        assert!(!store.state().unwrap().paired);
    }

    #[test]
    fn test_device_id_generated_once_and_persisted() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = store.ensure_device_id().unwrap();
        let second = store.ensure_device_id().unwrap();
        assert_eq!(first, second);

        // A fresh store reading the same file sees the same id
        let reloaded = store_in(&dir);
        reloaded.load().unwrap();
        assert_eq!(reloaded.ensure_device_id().unwrap(), first);
    }

    #[test]
    fn test_record_pairing_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .record_pairing("192.168.1.20", 8765, "Office PC", "482913", Some("a2V5"))
            .unwrap();

        let reloaded = store_in(&dir);
        reloaded.load().unwrap();
        let state = reloaded.state().unwrap();
        assert!(state.paired);
        assert_eq!(state.last_host.as_deref(), Some("192.168.1.20"));
        assert_eq!(state.peer_name.as_deref(), Some("Office PC"));
        assert_eq!(state.pairing_code.as_deref(), Some("482913"));
        assert_eq!(state.peer_public_key.as_deref(), Some("a2V5"));
    }

    #[test]
    fn test_clear_pairing_keeps_device_id() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let id = store.ensure_device_id().unwrap();
        store
            .record_pairing("10.0.0.5", 9000, "Laptop", "111222", None)
            .unwrap();

        store.clear_pairing().unwrap();

        let state = store.state().unwrap();
        assert!(!state.paired);
        assert!(state.last_host.is_none());
        assert!(state.peer_public_key.is_none());
        assert_eq!(state.device_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_load_invalid_file_errors() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(store.path(), "not json").unwrap();

        assert!(store.load().is_err());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save().unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_local_identity_uses_stored_device_id() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let identity = LocalIdentity::load(&store, "Pixel 9").unwrap();
        assert_eq!(identity.device_name, "Pixel 9");
        assert_eq!(identity.device_kind, "mobile");
        assert_eq!(identity.device_id, store.ensure_device_id().unwrap());
    }
}
