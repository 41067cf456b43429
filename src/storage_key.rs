//! Storage-key custodian — the rotating symmetric key guarding all
//! persisted state.
//!
//! The key lives in `.storage_key` (owner-only mode, never a symlink) and is
//! cached after the first read. `rotate()` hands back the previous key so
//! callers can re-encrypt their blobs.

use std::fs;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, random_bytes};
use crate::error::{AgentError, ErrorCode, Result};
use crate::paths::{write_atomic_private, DataDir};

#[derive(Debug, Clone, Copy)]
struct KeyState {
    key: [u8; 32],
    rotated_at: u64,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    key: String,
    rotated_at: u64,
}

pub struct StorageKeyCustodian {
    paths: DataDir,
    rotation_interval: Duration,
    cached: Mutex<Option<KeyState>>,
}

impl StorageKeyCustodian {
    pub fn new(paths: DataDir, rotation_interval: Duration) -> Self {
        Self {
            paths,
            rotation_interval,
            cached: Mutex::new(None),
        }
    }

    /// The current storage key. Loads the key file on first call, creating
    /// it with fresh random bytes if absent.
    pub fn get(&self) -> Result<[u8; 32]> {
        Ok(self.load_or_create()?.key)
    }

    /// Generate a fresh key and atomically replace the key file.
    /// Returns `(old, new)` so the caller can re-encrypt persisted blobs.
    pub fn rotate(&self) -> Result<([u8; 32], [u8; 32])> {
        let old = self.load_or_create()?;
        let state = KeyState {
            key: random_bytes::<32>(),
            rotated_at: now_secs(),
        };
        self.persist(&state)?;
        *self.cached.lock().unwrap() = Some(state);
        log::info!("storage key rotated");
        Ok((old.key, state.key))
    }

    pub fn should_rotate(&self) -> Result<bool> {
        let state = self.load_or_create()?;
        let age = now_secs().saturating_sub(state.rotated_at);
        Ok(age >= self.rotation_interval.as_secs())
    }

    /// Seal a blob for local persistence: AES-256-CBC with a fresh IV,
    /// framed as `base64(iv) ":" base64(ciphertext)`.
    pub fn encrypt_for_storage(&self, plaintext: &[u8]) -> Result<String> {
        let key = self.get()?;
        let iv = random_bytes::<16>();
        let ciphertext = aes_cbc_encrypt(&key, &iv, plaintext);
        Ok(format!("{}:{}", BASE64.encode(iv), BASE64.encode(ciphertext)))
    }

    pub fn decrypt_for_storage(&self, frame: &str) -> Result<Vec<u8>> {
        let key = self.get()?;
        decrypt_with(&key, frame)
    }

    /// Decrypt with an explicit key — used while re-encrypting after a
    /// rotation, when blobs are still sealed under the previous key.
    pub fn decrypt_with_key(&self, key: &[u8; 32], frame: &str) -> Result<Vec<u8>> {
        decrypt_with(key, frame)
    }

    fn load_or_create(&self) -> Result<KeyState> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(state) = *cached {
            return Ok(state);
        }

        let path = self.paths.storage_key();
        self.paths.guard_inside(&path)?;

        let state = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(AgentError::new(
                    ErrorCode::FileError,
                    "storage key file is a symbolic link; refusing to read it",
                ));
            }
            Ok(_) => {
                let raw = fs::read_to_string(&path)?;
                let file: KeyFile = serde_json::from_str(&raw).map_err(|e| {
                    AgentError::wrap(ErrorCode::FileError, format!("corrupt key file: {e}"))
                })?;
                let bytes = hex::decode(&file.key).map_err(|e| {
                    AgentError::wrap(ErrorCode::FileError, format!("corrupt key file: {e}"))
                })?;
                let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    AgentError::new(ErrorCode::FileError, "storage key must be 32 bytes")
                })?;
                KeyState { key, rotated_at: file.rotated_at }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = KeyState {
                    key: random_bytes::<32>(),
                    rotated_at: now_secs(),
                };
                self.persist(&state)?;
                log::info!("generated new storage key");
                state
            }
            Err(e) => return Err(e.into()),
        };

        *cached = Some(state);
        Ok(state)
    }

    fn persist(&self, state: &KeyState) -> Result<()> {
        let path = self.paths.storage_key();
        self.paths.guard_inside(&path)?;
        let file = KeyFile {
            key: hex::encode(state.key),
            rotated_at: state.rotated_at,
        };
        write_atomic_private(&path, serde_json::to_string(&file)?.as_bytes())
    }
}

fn decrypt_with(key: &[u8; 32], frame: &str) -> Result<Vec<u8>> {
    let (iv_b64, ct_b64) = frame.split_once(':').ok_or_else(|| {
        AgentError::new(ErrorCode::FileError, "malformed storage frame: missing separator")
    })?;
    let iv_bytes = BASE64
        .decode(iv_b64)
        .map_err(|e| AgentError::wrap(ErrorCode::FileError, format!("bad iv: {e}")))?;
    let iv: [u8; 16] = iv_bytes.as_slice().try_into().map_err(|_| {
        AgentError::new(ErrorCode::FileError, "storage frame iv must be 16 bytes")
    })?;
    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| AgentError::wrap(ErrorCode::FileError, format!("bad ciphertext: {e}")))?;
    aes_cbc_decrypt(key, &iv, &ciphertext)
        .map_err(|e| AgentError::wrap(ErrorCode::FileError, e))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn custodian(dir: &tempfile::TempDir) -> StorageKeyCustodian {
        let paths = DataDir::new(dir.path());
        paths.ensure().unwrap();
        StorageKeyCustodian::new(paths, Duration::from_secs(30 * 24 * 3600))
    }

    #[test]
    fn key_is_created_once_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let custodian = custodian(&dir);
        let first = custodian.get().unwrap();
        let second = custodian.get().unwrap();
        assert_eq!(first, second);

        // A fresh custodian over the same dir reads the same key back.
        let reread = StorageKeyCustodian::new(
            DataDir::new(dir.path()),
            Duration::from_secs(1),
        );
        assert_eq!(reread.get().unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let custodian = custodian(&dir);
        custodian.get().unwrap();
        let mode = fs::metadata(DataDir::new(dir.path()).storage_key())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_key_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("elsewhere");
        fs::write(&target, "{}").unwrap();
        std::os::unix::fs::symlink(&target, DataDir::new(dir.path()).storage_key()).unwrap();

        let custodian = custodian(&dir);
        let err = custodian.get().unwrap_err();
        assert_eq!(err.code, ErrorCode::FileError);
        assert!(err.message.contains("symbolic link"));
    }

    #[test]
    fn rotate_returns_old_and_new() {
        let dir = tempfile::tempdir().unwrap();
        let custodian = custodian(&dir);
        let original = custodian.get().unwrap();
        let (old, new) = custodian.rotate().unwrap();
        assert_eq!(old, original);
        assert_ne!(old, new);
        assert_eq!(custodian.get().unwrap(), new);
    }

    #[test]
    fn should_rotate_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataDir::new(dir.path());
        paths.ensure().unwrap();

        let custodian = StorageKeyCustodian::new(paths.clone(), Duration::from_secs(0));
        custodian.get().unwrap();
        assert!(custodian.should_rotate().unwrap());

        let fresh = StorageKeyCustodian::new(paths, Duration::from_secs(3600));
        assert!(!fresh.should_rotate().unwrap());
    }

    #[test]
    fn storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let custodian = custodian(&dir);
        let frame = custodian.encrypt_for_storage(b"group state").unwrap();
        assert_eq!(custodian.decrypt_for_storage(&frame).unwrap(), b"group state");

        // Fresh IV per call → distinct frames for identical plaintext.
        let other = custodian.encrypt_for_storage(b"group state").unwrap();
        assert_ne!(frame, other);
    }

    #[test]
    fn malformed_frames_are_format_errors() {
        let dir = tempfile::tempdir().unwrap();
        let custodian = custodian(&dir);
        assert!(custodian.decrypt_for_storage("no-separator").is_err());
        assert!(custodian.decrypt_for_storage("!!!:???").is_err());
        assert!(custodian.decrypt_for_storage("AAAA:AAAA").is_err());
    }

    #[test]
    fn reencrypt_after_rotation_with_old_key() {
        let dir = tempfile::tempdir().unwrap();
        let custodian = custodian(&dir);
        let frame = custodian.encrypt_for_storage(b"blob").unwrap();
        let (old, _new) = custodian.rotate().unwrap();

        // The frame no longer opens with the current key…
        if let Ok(plain) = custodian.decrypt_for_storage(&frame) {
            assert_ne!(plain, b"blob");
        }
        // …but does with the returned previous key.
        assert_eq!(custodian.decrypt_with_key(&old, &frame).unwrap(), b"blob");
    }
}
