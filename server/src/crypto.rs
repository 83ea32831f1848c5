//! At-rest encryption for log records: PBKDF2-HMAC-SHA256 key derivation
//! plus AES-256-GCM, serialized as a self-describing envelope.
//!
//! Every [`seal`] call draws a fresh random salt and derives its own
//! 256-bit key, so the operator manages one long-term secret and no two
//! records share a derived key. The envelope layout is:
//!
//! ```text
//! magic "LC1\0" | salt_len(1) | iv_len(1) | tag_len(1) | salt | iv | ciphertext | tag
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 150_000;

/// Envelope magic for the current (salted, derived-key) format.
pub const BLOB_MAGIC: [u8; 4] = *b"LC1\0";

const HEADER_LEN: usize = BLOB_MAGIC.len() + 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,
    /// The envelope itself is malformed: bad magic, impossible declared
    /// lengths, or parameters this version does not produce.
    #[error("corrupt blob")]
    CorruptBlob,
    /// Wrong key and tampered ciphertext are deliberately not
    /// distinguished.
    #[error("decryption failed")]
    Decrypt,
}

/// PBKDF2-HMAC-SHA256 over `(secret, salt)`. Deterministic for a given
/// pair; callers pass a fresh random salt per message.
pub fn derive_key(secret: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypts `plaintext` under a key derived from `secret` and a fresh
/// random salt, returning the serialized envelope.
pub fn seal(secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(secret, &salt);
    let cipher = Aes256Gcm::new(&key.into());
    // aes-gcm appends the 16-byte tag to the ciphertext, which is exactly
    // the `ciphertext | tag` tail of the envelope.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let mut blob = Vec::with_capacity(HEADER_LEN + SALT_LEN + NONCE_LEN + sealed.len());
    blob.extend_from_slice(&BLOB_MAGIC);
    blob.push(SALT_LEN as u8);
    blob.push(NONCE_LEN as u8);
    blob.push(TAG_LEN as u8);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Parses and validates an envelope, re-derives the key from the embedded
/// salt, and decrypts. Authentication failure of any kind maps to
/// [`CryptoError::Decrypt`].
pub fn open(secret: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < HEADER_LEN {
        return Err(CryptoError::CorruptBlob);
    }
    if blob[..BLOB_MAGIC.len()] != BLOB_MAGIC {
        return Err(CryptoError::CorruptBlob);
    }

    let salt_len = blob[4] as usize;
    let nonce_len = blob[5] as usize;
    let tag_len = blob[6] as usize;

    if HEADER_LEN + salt_len + nonce_len + tag_len > blob.len() {
        return Err(CryptoError::CorruptBlob);
    }
    // This version only ever writes fixed nonce/tag sizes.
    if nonce_len != NONCE_LEN || tag_len != TAG_LEN {
        return Err(CryptoError::CorruptBlob);
    }

    let salt = &blob[HEADER_LEN..HEADER_LEN + salt_len];
    let nonce = &blob[HEADER_LEN + salt_len..HEADER_LEN + salt_len + nonce_len];
    let sealed = &blob[HEADER_LEN + salt_len + nonce_len..];

    let key = derive_key(secret, salt);
    let cipher = Aes256Gcm::new(&key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let secret = b"operator secret";
        for plaintext in [&b""[..], b"a", b"hello world", &[0x42u8; 4096][..]] {
            let blob = seal(secret, plaintext).unwrap();
            assert_eq!(open(secret, &blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn open_fails_with_wrong_secret() {
        let blob = seal(b"right", b"message").unwrap();
        assert_eq!(open(b"wrong", &blob), Err(CryptoError::Decrypt));
    }

    #[test]
    fn any_bit_flip_in_ciphertext_or_tag_fails() {
        let secret = b"s";
        let blob = seal(secret, b"short message").unwrap();

        // Everything after salt and nonce is ciphertext + tag.
        let tail_start = HEADER_LEN + SALT_LEN + NONCE_LEN;
        for i in tail_start..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                open(secret, &tampered),
                Err(CryptoError::Decrypt),
                "byte {}",
                i
            );
        }
    }

    #[test]
    fn flipped_salt_or_nonce_fails() {
        let secret = b"s";
        let blob = seal(secret, b"payload").unwrap();

        let mut bad_salt = blob.clone();
        bad_salt[HEADER_LEN] ^= 0xff;
        assert_eq!(open(secret, &bad_salt), Err(CryptoError::Decrypt));

        let mut bad_nonce = blob.clone();
        bad_nonce[HEADER_LEN + SALT_LEN] ^= 0xff;
        assert_eq!(open(secret, &bad_nonce), Err(CryptoError::Decrypt));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut blob = seal(b"s", b"payload").unwrap();
        blob[0] = b'X';
        assert_eq!(open(b"s", &blob), Err(CryptoError::CorruptBlob));
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let blob = seal(b"s", b"payload").unwrap();
        let min_len = HEADER_LEN + SALT_LEN + NONCE_LEN + TAG_LEN;
        for n in 0..min_len {
            assert_eq!(
                open(b"s", &blob[..n]),
                Err(CryptoError::CorruptBlob),
                "len {}",
                n
            );
        }
    }

    #[test]
    fn declared_lengths_must_fit_the_buffer() {
        let mut blob = seal(b"s", b"payload").unwrap();
        blob[4] = 0xff; // declared salt larger than the whole blob
        assert_eq!(open(b"s", &blob), Err(CryptoError::CorruptBlob));
    }

    #[test]
    fn foreign_nonce_or_tag_sizes_are_rejected() {
        let mut blob = seal(b"s", b"payload").unwrap();
        blob[5] = 8;
        assert_eq!(open(b"s", &blob), Err(CryptoError::CorruptBlob));

        let mut blob = seal(b"s", b"payload").unwrap();
        blob[6] = 12;
        assert_eq!(open(b"s", &blob), Err(CryptoError::CorruptBlob));
    }

    #[test]
    fn derive_key_is_deterministic_and_salt_sensitive() {
        let a = derive_key(b"secret", b"0123456789abcdef");
        let b = derive_key(b"secret", b"0123456789abcdef");
        let c = derive_key(b"secret", b"fedcba9876543210");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn envelopes_for_identical_plaintext_differ() {
        let a = seal(b"s", b"same text").unwrap();
        let b = seal(b"s", b"same text").unwrap();
        // Fresh random salt and nonce per call.
        assert_ne!(a, b);
    }
}
