//! Key derivation: PIN or pairing secret + salt → 256-bit transfer key

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use ss_core::config::KdfConfig;
use ss_core::SALT_SIZE;

use crate::KEY_SIZE;

/// A 256-bit transfer key derived from a shared secret via PBKDF2.
///
/// Lives only in memory for one session. Zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// PBKDF2-HMAC-SHA256 rounds (default: 600000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: 600_000 }
    }
}

impl From<&KdfConfig> for KdfParams {
    fn from(cfg: &KdfConfig) -> Self {
        Self {
            iterations: cfg.iterations.max(1),
        }
    }
}

/// Derive the transfer key with the default iteration count.
pub fn derive_key(secret: &SecretString, salt: &[u8; SALT_SIZE]) -> DerivedKey {
    derive_key_with(secret, salt, &KdfParams::default())
}

/// Derive a 256-bit key from a secret and salt using PBKDF2-HMAC-SHA256.
///
/// The salt is 16 random bytes generated per transfer and sent in the clear.
pub fn derive_key_with(secret: &SecretString, salt: &[u8; SALT_SIZE], params: &KdfParams) -> DerivedKey {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        secret.expose_secret().as_bytes(),
        salt,
        params.iterations,
        &mut key,
    );
    DerivedKey::from_bytes(key)
}

/// Key for sealing signaling messages on a shared relay.
///
/// The transfer salt travels inside the offer, so signaling uses a salt
/// derived from the secret itself.
pub fn signal_key(secret: &SecretString, params: &KdfParams) -> DerivedKey {
    let digest = Sha256::new()
        .chain_update(b"securesend-signal-salt-v1")
        .chain_update(secret.expose_secret().as_bytes())
        .finalize();
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&digest[..SALT_SIZE]);
    derive_key_with(secret, &salt, params)
}

/// Fresh random per-transfer salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
