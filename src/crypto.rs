//! Shared Curve25519 / HKDF / AES helpers used by the sealing modules.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed ciphertext frame")]
    InvalidFrame,
    #[error("invalid key material")]
    InvalidKey,
    #[error("topic must be a non-empty string of at most {0} characters")]
    InvalidTopic(usize),
    #[error("decryption failed — wrong key or tampered ciphertext")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
/// Uses SHA-512/clamp derivation (RFC 7748 §5).
pub fn ed25519_seed_to_x25519(seed_bytes: &[u8; 32]) -> StaticSecret {
    use sha2::Digest;
    let hash = sha2::Sha512::digest(seed_bytes);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert a 32-byte Ed25519 compressed public key to X25519 Montgomery form.
/// Fails for byte strings that are not a valid Edwards point.
pub fn ed25519_pubkey_to_x25519(pubkey_bytes: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY(*pubkey_bytes);
    let point = compressed.decompress().ok_or(CryptoError::InvalidKey)?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// One-shot HKDF-SHA256 expand into a caller-sized buffer.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out).expect("HKDF output length is valid");
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// AES-256-CBC with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn aes_cbc_decrypt(
    key: &[u8; 32],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
