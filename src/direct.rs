//! Per-recipient direct-message sealing.
//!
//! Symmetric key = SHA-256 over the X25519 shared secret between the
//! sender's seed and the recipient's public key (both sides derive the same
//! key, so the frame carries no key material). Payload is AES-256-CBC with a
//! fresh 16-byte IV, framed in the legacy NIP-04 form:
//!
//!   base64(ciphertext) "?iv=" base64(iv)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt, ed25519_pubkey_to_x25519, ed25519_seed_to_x25519,
    random_bytes, CryptoError,
};

const IV_LEN: usize = 16;

/// Derive the conversation key shared by `(our_seed, their_pubkey)`.
fn conversation_key(
    our_seed: &[u8; 32],
    their_pubkey: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let secret = ed25519_seed_to_x25519(our_seed);
    let public = ed25519_pubkey_to_x25519(their_pubkey)?;
    let shared = secret.diffie_hellman(&public);
    Ok(Sha256::digest(shared.as_bytes()).into())
}

/// Seal `plaintext` so only `recipient_pubkey` can read it.
pub fn encrypt(
    sender_seed: &[u8; 32],
    recipient_pubkey: &[u8; 32],
    plaintext: &[u8],
) -> Result<String, CryptoError> {
    let key = conversation_key(sender_seed, recipient_pubkey)?;
    let iv = random_bytes::<IV_LEN>();
    let ciphertext = aes_cbc_encrypt(&key, &iv, plaintext);
    Ok(format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Open a frame sealed by `sender_pubkey` for us.
pub fn decrypt(
    recipient_seed: &[u8; 32],
    sender_pubkey: &[u8; 32],
    frame: &str,
) -> Result<Vec<u8>, CryptoError> {
    let (ct_b64, iv_b64) = frame.split_once("?iv=").ok_or(CryptoError::InvalidFrame)?;
    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|_| CryptoError::InvalidFrame)?;
    let iv_bytes = BASE64.decode(iv_b64).map_err(|_| CryptoError::InvalidFrame)?;
    let iv: [u8; IV_LEN] = iv_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidFrame)?;

    let key = conversation_key(recipient_seed, sender_pubkey)?;
    aes_cbc_decrypt(&key, &iv, &ciphertext)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let seed = random_bytes::<32>();
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        (seed, *signing.verifying_key().as_bytes())
    }

    #[test]
    fn roundtrip() {
        let (sender_seed, sender_pk) = keypair();
        let (recipient_seed, recipient_pk) = keypair();

        let frame = encrypt(&sender_seed, &recipient_pk, b"hello agent").unwrap();
        let plain = decrypt(&recipient_seed, &sender_pk, &frame).unwrap();
        assert_eq!(plain, b"hello agent");
    }

    #[test]
    fn fresh_iv_per_call() {
        let (sender_seed, _) = keypair();
        let (_, recipient_pk) = keypair();

        let a = encrypt(&sender_seed, &recipient_pk, b"same").unwrap();
        let b = encrypt(&sender_seed, &recipient_pk, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let (seed_a, pk_a) = keypair();
        let (seed_b, pk_b) = keypair();
        assert_eq!(
            conversation_key(&seed_a, &pk_b).unwrap(),
            conversation_key(&seed_b, &pk_a).unwrap()
        );
    }

    #[test]
    fn wrong_recipient_fails() {
        let (sender_seed, sender_pk) = keypair();
        let (_, recipient_pk) = keypair();
        let (eavesdropper_seed, _) = keypair();

        let frame = encrypt(&sender_seed, &recipient_pk, b"secret").unwrap();
        if let Ok(plain) = decrypt(&eavesdropper_seed, &sender_pk, &frame) {
            assert_ne!(plain, b"secret");
        }
    }

    #[test]
    fn malformed_frames_fail() {
        let (seed, pk) = keypair();
        assert!(matches!(
            decrypt(&seed, &pk, "no-separator"),
            Err(CryptoError::InvalidFrame)
        ));
        assert!(matches!(
            decrypt(&seed, &pk, "AAAA?iv=shortiv"),
            Err(CryptoError::InvalidFrame)
        ));
        // 8-byte IV is the wrong length for CBC.
        let bad_iv = BASE64.encode([0u8; 8]);
        assert!(matches!(
            decrypt(&seed, &pk, &format!("AAAA?iv={bad_iv}")),
            Err(CryptoError::InvalidFrame)
        ));
    }
}
