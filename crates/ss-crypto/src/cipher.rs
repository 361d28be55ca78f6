//! Single-shot AES-256-GCM
//!
//! Blob format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;

use ss_core::{SsError, SsResult, MAX_PAYLOAD};

use crate::kdf::DerivedKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// Returns `[12-byte nonce][ciphertext][16-byte tag]`.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> SsResult<Vec<u8>> {
    check_size(plaintext.len())?;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    seal(key, &nonce, plaintext, &[])
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Any tag failure is `AuthenticationFailed`, whether the key was wrong or
/// the bytes were corrupted.
pub fn decrypt(key: &DerivedKey, blob: &[u8]) -> SsResult<Vec<u8>> {
    check_size(blob.len().saturating_sub(NONCE_SIZE + TAG_SIZE))?;
    open(key, blob, &[])
}

/// Reject payloads above the global ceiling before touching the cipher.
pub(crate) fn check_size(len: usize) -> SsResult<()> {
    if len as u64 > MAX_PAYLOAD {
        return Err(SsError::SizeLimitExceeded {
            size: len as u64,
            limit: MAX_PAYLOAD,
        });
    }
    Ok(())
}

pub(crate) fn seal(
    key: &DerivedKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> SsResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| SsError::Other(anyhow::anyhow!("AES-GCM encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

pub(crate) fn open(key: &DerivedKey, blob: &[u8], aad: &[u8]) -> SsResult<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(SsError::AuthenticationFailed);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SsError::AuthenticationFailed)
}
