//! Per-topic group-message sealing.
//!
//! The group key is derived deterministically from the topic secret so any
//! holder of the topic can decrypt. Current frames are AES-256-GCM with the
//! raw topic bytes bound in as AAD:
//!
//!   "v2" ":" base64(nonce) ":" base64(ciphertext) ":" base64(tag)
//!
//! Frames without the `v2:` prefix are archival AES-256-CBC ciphertexts from
//! the previous scheme; they decrypt forever but are never produced anymore.

use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, KeyInit, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::crypto::{aes_cbc_decrypt, hkdf_sha256, random_bytes, CryptoError};

const APP_ID: &[u8] = b"agent-p2p-group-v3";
const LEGACY_APP_ID: &[u8] = b"agent-p2p-group-v2";
const FRAME_PREFIX: &str = "v2:";
const MAX_TOPIC_LEN: usize = 200;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

fn validate_topic(topic: &str) -> Result<&[u8], CryptoError> {
    if topic.is_empty() || topic.chars().count() > MAX_TOPIC_LEN {
        return Err(CryptoError::InvalidTopic(MAX_TOPIC_LEN));
    }
    Ok(topic.as_bytes())
}

/// Two-step derivation: an app-scoped salt, then the encryption key.
fn derive_key(topic: &[u8]) -> [u8; 32] {
    let mut salt = [0u8; 32];
    hkdf_sha256(topic, APP_ID, b"salt", &mut salt);
    let mut key = [0u8; 32];
    hkdf_sha256(topic, &salt, b"encryption", &mut key);
    key
}

fn derive_legacy_key(topic: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    hkdf_sha256(topic, LEGACY_APP_ID, b"encryption", &mut key);
    key
}

/// First 8 IV bytes of a legacy frame; the wire carries only the random
/// suffix.
fn derive_legacy_iv_prefix(topic: &[u8]) -> [u8; 8] {
    let mut prefix = [0u8; 8];
    hkdf_sha256(topic, LEGACY_APP_ID, b"iv", &mut prefix);
    prefix
}

/// Seal `plaintext` under `topic`. The topic is authenticated into the tag,
/// so a frame lifted into another group fails to open.
pub fn encrypt(topic: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
    let topic_bytes = validate_topic(topic)?;
    let key = derive_key(topic_bytes);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Encrypt)?;

    let nonce_bytes = random_bytes::<NONCE_LEN>();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: topic_bytes })
        .map_err(|_| CryptoError::Encrypt)?;

    // aes-gcm appends the tag; the frame carries it separately.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    Ok(format!(
        "{FRAME_PREFIX}{}:{}:{}",
        BASE64.encode(nonce_bytes),
        BASE64.encode(ciphertext),
        BASE64.encode(tag)
    ))
}

/// Open a group frame, current or legacy.
pub fn decrypt(topic: &str, frame: &str) -> Result<Vec<u8>, CryptoError> {
    let topic_bytes = validate_topic(topic)?;
    match frame.strip_prefix(FRAME_PREFIX) {
        Some(rest) => decrypt_current(topic_bytes, rest),
        None => decrypt_legacy(topic_bytes, frame),
    }
}

fn decrypt_current(topic: &[u8], rest: &str) -> Result<Vec<u8>, CryptoError> {
    let mut parts = rest.splitn(3, ':');
    let (nonce_b64, ct_b64, tag_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(n), Some(c), Some(t)) => (n, c, t),
        _ => return Err(CryptoError::InvalidFrame),
    };

    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|_| CryptoError::InvalidFrame)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::InvalidFrame);
    }
    let ciphertext = BASE64.decode(ct_b64).map_err(|_| CryptoError::InvalidFrame)?;
    let tag = BASE64.decode(tag_b64).map_err(|_| CryptoError::InvalidFrame)?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFrame);
    }

    let key = derive_key(topic);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Decrypt)?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload { msg: &sealed, aad: topic },
        )
        .map_err(|_| CryptoError::Decrypt)
}

fn decrypt_legacy(topic: &[u8], frame: &str) -> Result<Vec<u8>, CryptoError> {
    let (suffix_b64, ct_b64) = frame.split_once(':').ok_or(CryptoError::InvalidFrame)?;
    let suffix_bytes = BASE64
        .decode(suffix_b64)
        .map_err(|_| CryptoError::InvalidFrame)?;
    let suffix: [u8; 8] = suffix_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidFrame)?;
    let ciphertext = BASE64.decode(ct_b64).map_err(|_| CryptoError::InvalidFrame)?;

    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&derive_legacy_iv_prefix(topic));
    iv[8..].copy_from_slice(&suffix);

    aes_cbc_decrypt(&derive_legacy_key(topic), &iv, &ciphertext)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes_cbc_encrypt;

    /// Legacy encoder — exists only so the decrypt path is pinned bit-exact.
    fn legacy_encrypt(topic: &str, plaintext: &[u8]) -> String {
        let topic_bytes = topic.as_bytes();
        let suffix = random_bytes::<8>();
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&derive_legacy_iv_prefix(topic_bytes));
        iv[8..].copy_from_slice(&suffix);
        let ciphertext = aes_cbc_encrypt(&derive_legacy_key(topic_bytes), &iv, plaintext);
        format!("{}:{}", BASE64.encode(suffix), BASE64.encode(ciphertext))
    }

    #[test]
    fn roundtrip() {
        let frame = encrypt("team-topic", b"standup in 5").unwrap();
        assert!(frame.starts_with("v2:"));
        assert_eq!(decrypt("team-topic", &frame).unwrap(), b"standup in 5");
    }

    #[test]
    fn unicode_roundtrip() {
        let msg = "Hello 🎉".as_bytes();
        let frame = encrypt("unicode", msg).unwrap();
        assert_eq!(decrypt("unicode", &frame).unwrap(), msg);
    }

    #[test]
    fn wrong_topic_fails() {
        let frame = encrypt("topic-one", b"secret").unwrap();
        assert!(decrypt("topic-two", &frame).is_err());
    }

    #[test]
    fn ciphertexts_and_nonces_differ_across_calls() {
        let a = encrypt("t", b"same plaintext").unwrap();
        let b = encrypt("t", b"same plaintext").unwrap();
        assert_ne!(a, b);

        let nonce = |frame: &str| frame.split(':').nth(1).unwrap().to_string();
        assert_ne!(nonce(&a), nonce(&b));
    }

    #[test]
    fn bit_flips_fail_everywhere() {
        let frame = encrypt("t", b"payload bytes").unwrap();
        let parts: Vec<&str> = frame.split(':').collect();

        // Flip one byte of the ciphertext.
        let mut ct = BASE64.decode(parts[2]).unwrap();
        ct[0] ^= 0x01;
        let tampered_ct = format!("v2:{}:{}:{}", parts[1], BASE64.encode(&ct), parts[3]);
        assert!(decrypt("t", &tampered_ct).is_err());

        // Flip one byte of the tag.
        let mut tag = BASE64.decode(parts[3]).unwrap();
        tag[15] ^= 0x80;
        let tampered_tag = format!("v2:{}:{}:{}", parts[1], parts[2], BASE64.encode(&tag));
        assert!(decrypt("t", &tampered_tag).is_err());
    }

    #[test]
    fn wrong_nonce_length_fails() {
        let frame = encrypt("t", b"x").unwrap();
        let parts: Vec<&str> = frame.split(':').collect();
        let short_nonce = BASE64.encode([0u8; 8]);
        let bad = format!("v2:{}:{}:{}", short_nonce, parts[2], parts[3]);
        assert!(matches!(decrypt("t", &bad), Err(CryptoError::InvalidFrame)));
    }

    #[test]
    fn legacy_frames_still_decrypt() {
        let frame = legacy_encrypt("old-topic", b"archival message");
        assert!(!frame.starts_with("v2:"));
        assert_eq!(decrypt("old-topic", &frame).unwrap(), b"archival message");
    }

    #[test]
    fn legacy_wrong_topic_fails() {
        let frame = legacy_encrypt("old-topic", b"archival message");
        if let Ok(plain) = decrypt("different", &frame) {
            assert_ne!(plain, b"archival message");
        }
    }

    #[test]
    fn topic_limits() {
        assert!(matches!(
            encrypt("", b"x"),
            Err(CryptoError::InvalidTopic(_))
        ));
        let long = "t".repeat(201);
        assert!(matches!(
            encrypt(&long, b"x"),
            Err(CryptoError::InvalidTopic(_))
        ));
        let max = "t".repeat(200);
        assert!(encrypt(&max, b"x").is_ok());
    }

    #[test]
    fn malformed_current_frames_fail() {
        assert!(decrypt("t", "v2:only-two:parts").is_err());
        assert!(decrypt("t", "v2:!!!:???:###").is_err());
    }
}
