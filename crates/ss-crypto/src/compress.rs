//! Raw deflate with an inflate ceiling

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

use ss_core::{SsError, SsResult};

pub fn deflate(data: &[u8]) -> SsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    DeflateEncoder::new(data, Compression::best()).read_to_end(&mut out)?;
    Ok(out)
}

/// Inflate at most `limit` bytes; anything larger is rejected rather than
/// expanded in memory.
pub fn inflate(data: &[u8], limit: u64) -> SsResult<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| SsError::malformed(format!("inflate failed: {e}")))?;
    if out.len() as u64 > limit {
        return Err(SsError::SizeLimitExceeded {
            size: out.len() as u64,
            limit,
        });
    }
    Ok(out)
}
