//! Per-chunk AES-256-GCM encryption/decryption for streamed transfers
//!
//! Encrypted chunk frame (binary):
//! ```text
//! [4 bytes: chunk index, BE][12 bytes: nonce][N bytes: ciphertext][16 bytes: tag]
//! nonce = base_nonce XOR (index as u64, BE) in its last 8 bytes
//! AAD   = index (8 bytes, big-endian)
//! ```
//!
//! The index is authenticated, so a chunk replayed at another position fails
//! its tag check instead of landing in the wrong place.

use rand::RngCore;

use ss_core::{SsError, SsResult, MAX_PAYLOAD};

use crate::cipher::{check_size, open, seal};
use crate::kdf::DerivedKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Plaintext bytes per chunk (256 KiB). Bounds memory per in-flight message.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Size of the big-endian index prefix on the wire
pub const INDEX_SIZE: usize = 4;

/// Bytes a frame carries beyond its plaintext
pub const CHUNK_FRAME_OVERHEAD: usize = INDEX_SIZE + NONCE_SIZE + TAG_SIZE;

/// One encrypted chunk: its index plus `nonce ∥ ciphertext ∥ tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub index: u32,
    pub blob: Vec<u8>,
}

impl EncryptedChunk {
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(INDEX_SIZE + self.blob.len());
        frame.extend_from_slice(&self.index.to_be_bytes());
        frame.extend_from_slice(&self.blob);
        frame
    }

    pub fn from_frame(frame: &[u8]) -> SsResult<Self> {
        if frame.len() < CHUNK_FRAME_OVERHEAD {
            return Err(SsError::malformed(format!(
                "chunk frame too short: {} bytes",
                frame.len()
            )));
        }
        let (index, blob) = frame.split_at(INDEX_SIZE);
        let index = u32::from_be_bytes([index[0], index[1], index[2], index[3]]);
        Ok(Self {
            index,
            blob: blob.to_vec(),
        })
    }
}

/// Sender-side chunk encryptor bound to one transfer's key and base nonce.
pub struct ChunkSealer {
    key: DerivedKey,
    base_nonce: [u8; NONCE_SIZE],
}

impl ChunkSealer {
    /// New sealer with a random per-transfer base nonce.
    pub fn new(key: &DerivedKey) -> Self {
        let mut base_nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut base_nonce);
        Self::with_base_nonce(key, base_nonce)
    }

    pub fn with_base_nonce(key: &DerivedKey, base_nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            key: key.clone(),
            base_nonce,
        }
    }

    /// Encrypt one chunk at position `index`.
    pub fn encrypt_chunk(&self, index: u32, plaintext: &[u8]) -> SsResult<EncryptedChunk> {
        check_size(plaintext.len())?;
        let nonce = chunk_nonce(&self.base_nonce, index);
        let blob = seal(&self.key, &nonce, plaintext, &build_aad(index))?;
        Ok(EncryptedChunk { index, blob })
    }
}

/// Decrypt a chunk frame, returning its authenticated index and plaintext.
pub fn decrypt_chunk(key: &DerivedKey, frame: &[u8]) -> SsResult<(u32, Vec<u8>)> {
    if frame.len() as u64 > MAX_PAYLOAD {
        return Err(SsError::SizeLimitExceeded {
            size: frame.len() as u64,
            limit: MAX_PAYLOAD,
        });
    }
    let chunk = EncryptedChunk::from_frame(frame)?;
    let plaintext = open(key, &chunk.blob, &build_aad(chunk.index))?;
    Ok((chunk.index, plaintext))
}

/// Number of chunks needed for `total` bytes (zero for an empty payload).
pub fn chunk_count(total: u64, chunk_size: usize) -> u32 {
    total.div_ceil(chunk_size.max(1) as u64) as u32
}

/// XOR the index into the last 8 bytes of the base nonce.
fn chunk_nonce(base: &[u8; NONCE_SIZE], index: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (n, i) in nonce[4..].iter_mut().zip(u64::from(index).to_be_bytes()) {
        *n ^= i;
    }
    nonce
}

/// AAD: chunk index (8 bytes BE)
fn build_aad(index: u32) -> [u8; 8] {
    u64::from(index).to_be_bytes()
}
