//! Clipboard / QR envelope: a self-contained encrypted JSON document
//!
//! ```text
//! ["SS01"][16 bytes: salt][12 bytes: nonce][encrypt(deflate(JSON))][16 bytes: tag]
//! ```
//!
//! Decoding checks, in order: magic, salt, key derivation, tag, inflate,
//! UTF-8 JSON. Each stage reports its own error.

use secrecy::SecretString;
use serde::{de::DeserializeOwned, Serialize};

use ss_core::{SsError, SsResult, MAX_PAYLOAD, SALT_SIZE};

use crate::cipher::{decrypt, encrypt};
use crate::compress::{deflate, inflate};
use crate::kdf::{derive_key_with, generate_salt, KdfParams};
use crate::{NONCE_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 4] = b"SS01";

const HEADER_LEN: usize = MAGIC.len() + SALT_SIZE;

/// Serialize, compress and encrypt `value` under a key derived from `secret`.
pub fn seal_envelope<T: Serialize>(
    secret: &SecretString,
    value: &T,
    params: &KdfParams,
) -> SsResult<Vec<u8>> {
    let json = serde_json::to_vec(value)
        .map_err(|e| SsError::malformed(format!("serializing envelope: {e}")))?;
    let compressed = deflate(&json)?;

    let salt = generate_salt();
    let key = derive_key_with(secret, &salt, params);
    let sealed = encrypt(&key, &compressed)?;

    let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`seal_envelope`].
pub fn open_envelope<T: DeserializeOwned>(
    secret: &SecretString,
    bytes: &[u8],
    params: &KdfParams,
) -> SsResult<T> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(SsError::malformed("not a SecureSend envelope (bad magic)"));
    }
    if bytes.len() < HEADER_LEN + NONCE_SIZE + TAG_SIZE {
        return Err(SsError::malformed(format!(
            "envelope truncated: {} bytes",
            bytes.len()
        )));
    }

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&bytes[MAGIC.len()..HEADER_LEN]);
    let key = derive_key_with(secret, &salt, params);

    let compressed = decrypt(&key, &bytes[HEADER_LEN..])?;
    let json = inflate(&compressed, MAX_PAYLOAD)?;
    let text = std::str::from_utf8(&json)
        .map_err(|e| SsError::malformed(format!("envelope is not UTF-8: {e}")))?;
    serde_json::from_str(text).map_err(|e| SsError::malformed(format!("envelope JSON: {e}")))
}
