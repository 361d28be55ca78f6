//! Master key, derived identity and fingerprints

use hkdf::Hkdf;
use hmac::digest::{generic_array::GenericArray, KeyInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use ss_core::{SsError, SsResult};

use crate::{PUBLIC_ID_SIZE, PUBLIC_KEY_SIZE};

type HmacSha256 = Hmac<Sha256>;

const PUBLIC_ID_INFO: &[u8] = b"securesend-public-id-v1";
const SIGNING_INFO: &[u8] = b"securesend-hmac-v1";

/// Root secret produced by the authenticator's PRF extension.
///
/// There is deliberately no way to read the bytes back out; everything
/// downstream is derived inside this module. Zeroized on drop.
pub struct MasterKey {
    bytes: [u8; 32],
}

impl MasterKey {
    pub fn from_prf_output(output: [u8; 32]) -> Self {
        Self { bytes: output }
    }

    fn expand(&self, info: &[u8]) -> SsResult<[u8; 32]> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = [0u8; 32];
        hkdf.expand(info, &mut okm)
            .map_err(|e| SsError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
        Ok(okm)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A passkey-backed identity: a public id anyone may see, an HMAC key only
/// the owner holds, and the credential's own ECDSA public key.
pub struct Identity {
    public_id: [u8; PUBLIC_ID_SIZE],
    signing_key: [u8; 32],
    credential_key: [u8; PUBLIC_KEY_SIZE],
}

impl Identity {
    pub fn derive(master: &MasterKey, credential_key: [u8; PUBLIC_KEY_SIZE]) -> SsResult<Self> {
        check_public_key(&credential_key)?;
        Ok(Self {
            public_id: master.expand(PUBLIC_ID_INFO)?,
            signing_key: master.expand(SIGNING_INFO)?,
            credential_key,
        })
    }

    pub fn public_id(&self) -> &[u8; PUBLIC_ID_SIZE] {
        &self.public_id
    }

    pub fn credential_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.credential_key
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_id)
    }

    /// HMAC-SHA256 over `message` with this identity's signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 32] {
        let mut mac = self.mac();
        mac.update(message);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of a tag produced by [`Identity::sign`].
    pub fn verify(&self, message: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(message);
        mac.verify_slice(tag).is_ok()
    }

    fn mac(&self) -> HmacSha256 {
        // Keys shorter than the SHA-256 block are zero-padded by HMAC itself.
        let mut block = [0u8; 64];
        block[..32].copy_from_slice(&self.signing_key);
        let mac = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(&block));
        block.zeroize();
        mac
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.signing_key.zeroize();
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// First 8 bytes of SHA-256 as `XXXX-XXXX-XXXX-XXXX`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex = hex::encode_upper(&digest[..8]);
    hex.as_bytes()
        .chunks(4)
        .map(|group| std::str::from_utf8(group).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

/// A P-256 public key must be 65 bytes, uncompressed (leading `0x04`).
pub(crate) fn check_public_key(key: &[u8]) -> SsResult<()> {
    if key.len() != PUBLIC_KEY_SIZE {
        return Err(SsError::malformed(format!(
            "public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }
    if key[0] != 0x04 {
        return Err(SsError::malformed(format!(
            "public key must be uncompressed (0x04), got 0x{:02x}",
            key[0]
        )));
    }
    Ok(())
}
