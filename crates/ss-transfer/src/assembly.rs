//! Receiver-side chunk buffer
//!
//! Chunks land by authenticated index, not arrival order. Plaintext is held
//! in zeroizing buffers so a failed transfer leaves nothing behind.

use std::collections::BTreeMap;

use tracing::debug;
use zeroize::Zeroizing;

use ss_core::{SsError, SsResult, TransferMetadata};
use ss_crypto::{decrypt_chunk, DerivedKey};

pub(crate) struct Assembly {
    chunks: BTreeMap<u32, Zeroizing<Vec<u8>>>,
    expected_chunks: u32,
    expected_bytes: u64,
    received_bytes: u64,
}

impl Assembly {
    pub(crate) fn new(metadata: &TransferMetadata) -> Self {
        Self {
            chunks: BTreeMap::new(),
            expected_chunks: metadata.chunk_count,
            expected_bytes: metadata.total_bytes,
            received_bytes: 0,
        }
    }

    /// Decrypt and file one chunk frame. Returns false for a duplicate.
    pub(crate) fn accept(&mut self, key: &DerivedKey, frame: &[u8]) -> SsResult<bool> {
        let (index, plaintext) = decrypt_chunk(key, frame)?;
        let plaintext = Zeroizing::new(plaintext);
        if index >= self.expected_chunks {
            return Err(SsError::malformed(format!(
                "chunk {index} is beyond the declared {} chunks",
                self.expected_chunks
            )));
        }
        if self.chunks.contains_key(&index) {
            debug!(index, "duplicate chunk ignored");
            return Ok(false);
        }
        let received = self.received_bytes + plaintext.len() as u64;
        if received > self.expected_bytes {
            return Err(SsError::SizeLimitExceeded {
                size: received,
                limit: self.expected_bytes,
            });
        }
        self.received_bytes = received;
        self.chunks.insert(index, plaintext);
        Ok(true)
    }

    pub(crate) fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Concatenate in index order once every chunk is present and the
    /// length matches the metadata.
    pub(crate) fn finish(self) -> SsResult<Zeroizing<Vec<u8>>> {
        let missing = self.expected_chunks - self.received();
        if missing > 0 {
            return Err(SsError::malformed(format!(
                "sender finished with {missing} of {} chunks missing",
                self.expected_chunks
            )));
        }
        if self.received_bytes != self.expected_bytes {
            return Err(SsError::malformed(format!(
                "assembled {} bytes, metadata declared {}",
                self.received_bytes, self.expected_bytes
            )));
        }
        let mut out = Zeroizing::new(Vec::with_capacity(self.expected_bytes as usize));
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }
}
