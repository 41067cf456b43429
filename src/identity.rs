//! Long-lived agent identity — an Ed25519 keypair persisted encrypted at rest.
//!
//! The public key (lowercase 64-char hex) is the stable address every peer
//! uses to reach this agent. The secret never touches disk in the clear: the
//! identity file is sealed by the storage-key custodian.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::crypto::ed25519_seed_to_x25519;
use crate::error::{AgentError, ErrorCode, Result};
use crate::paths::{write_atomic_private, DataDir};
use crate::storage_key::StorageKeyCustodian;

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    /// Hex-encoded Ed25519 seed (32 bytes → 64 hex chars). Never logged.
    secret_key: String,
    /// Hex-encoded Ed25519 public key. This is the agent address.
    public_key: String,
}

pub struct Identity {
    signing: SigningKey,
    public_key_hex: String,
}

impl Identity {
    /// Load the persisted identity, creating one on first run.
    pub fn load_or_create(paths: &DataDir, custodian: &StorageKeyCustodian) -> Result<Self> {
        let path = paths.identity();
        paths.guard_inside(&path)?;

        if path.exists() {
            let frame = std::fs::read_to_string(&path)?;
            let plain = custodian.decrypt_for_storage(frame.trim())?;
            let file: IdentityFile = serde_json::from_slice(&plain).map_err(|e| {
                AgentError::wrap(ErrorCode::FileError, format!("corrupt identity file: {e}"))
            })?;
            let seed_bytes = hex::decode(&file.secret_key).map_err(|e| {
                AgentError::wrap(ErrorCode::FileError, format!("corrupt identity file: {e}"))
            })?;
            let seed: [u8; 32] = seed_bytes.as_slice().try_into().map_err(|_| {
                AgentError::new(ErrorCode::FileError, "identity seed must be 32 bytes")
            })?;
            let signing = SigningKey::from_bytes(&seed);
            let public_key_hex = hex::encode(signing.verifying_key().as_bytes());
            if public_key_hex != file.public_key {
                return Err(AgentError::new(
                    ErrorCode::FileError,
                    "identity file public key does not match its secret",
                ));
            }
            return Ok(Self { signing, public_key_hex });
        }

        let signing = SigningKey::from_bytes(&crate::crypto::random_bytes::<32>());
        let public_key_hex = hex::encode(signing.verifying_key().as_bytes());
        let identity = Self { signing, public_key_hex };
        identity.persist(paths, custodian)?;
        log::info!("created new agent identity {}", identity.public_key_hex);
        Ok(identity)
    }

    /// Re-seal the identity file under the custodian's current key. Called
    /// on creation and again after every storage-key rotation.
    pub fn persist(&self, paths: &DataDir, custodian: &StorageKeyCustodian) -> Result<()> {
        let file = IdentityFile {
            secret_key: hex::encode(self.signing.to_bytes()),
            public_key: self.public_key_hex.clone(),
        };
        let frame = custodian.encrypt_for_storage(&serde_json::to_vec(&file)?)?;
        write_atomic_private(&paths.identity(), frame.as_bytes())
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Raw Ed25519 seed, needed for the ECDH conversion.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// X25519 secret for ECDH with peer public keys.
    pub fn x25519_secret(&self) -> StaticSecret {
        ed25519_seed_to_x25519(&self.signing.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

/// Verify an Ed25519 signature against a hex-encoded public key.
pub fn verify_signature(pubkey_hex: &str, message: &[u8], sig_hex: &str) -> bool {
    let Ok(pk) = parse_pubkey(pubkey_hex) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_arr)).is_ok()
}

/// Validate the wire form of an agent address: exactly 64 lowercase hex chars.
pub fn parse_pubkey(s: &str) -> Result<[u8; 32]> {
    if s.len() != 64
        || !s
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(AgentError::new(
            ErrorCode::InvalidPubkey,
            format!("public key must be 64 lowercase hex characters, got {:?}", s),
        ));
    }
    let bytes = hex::decode(s)
        .map_err(|e| AgentError::wrap(ErrorCode::InvalidPubkey, e))?;
    Ok(bytes.as_slice().try_into().expect("64 hex chars decode to 32 bytes"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
