//! Pairing: ephemeral ECDH between two identities, mutually HMAC-signed
//!
//! ```text
//! A: (eph_a, id_a) ──offer──▶ B        B: (eph_b, id_b) ──offer──▶ A
//! shared = ECDH(eph_self, eph_peer)
//! (lo, hi) = ids sorted bytewise
//! key = HKDF-SHA256(salt = lo ∥ hi, ikm = shared, info = "securesend-pairing-v1")
//! material = "securesend-pairing-v1" ∥ lo ∥ hi ∥ SHA-256(key)
//! ```
//! Each side signs `material` with its own HMAC key and attaches the peer's
//! signature when it arrives. A side can only check its own signature; the
//! counterpart is trusted through an out-of-band fingerprint comparison.

use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroize;

use ss_core::{SsError, SsResult};

use crate::identity::{check_public_key, fingerprint, Identity};
use crate::{PUBLIC_ID_SIZE, PUBLIC_KEY_SIZE};

const PAIRING_INFO: &[u8] = b"securesend-pairing-v1";

/// What one side sends the other to start pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOffer {
    pub public_id: [u8; PUBLIC_ID_SIZE],
    pub ephemeral_key: [u8; PUBLIC_KEY_SIZE],
}

/// One side's in-progress pairing. Consumed by [`PairingSession::complete`].
pub struct PairingSession {
    secret: EphemeralSecret,
    offer: PairingOffer,
}

impl PairingSession {
    pub fn start(identity: &Identity) -> Self {
        let secret = EphemeralSecret::random(&mut rand::rngs::OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut ephemeral_key = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_key.copy_from_slice(point.as_bytes());
        Self {
            secret,
            offer: PairingOffer {
                public_id: *identity.public_id(),
                ephemeral_key,
            },
        }
    }

    pub fn offer(&self) -> &PairingOffer {
        &self.offer
    }

    /// Agree on the pairing key with `peer` and sign it as `identity`.
    pub fn complete(self, identity: &Identity, peer: &PairingOffer) -> SsResult<PairingKey> {
        if identity.public_id() != &self.offer.public_id {
            return Err(SsError::malformed("pairing session belongs to another identity"));
        }
        if peer.public_id == self.offer.public_id {
            return Err(SsError::malformed("cannot pair an identity with itself"));
        }
        check_public_key(&peer.ephemeral_key)?;
        let peer_key = PublicKey::from_sec1_bytes(&peer.ephemeral_key)
            .map_err(|_| SsError::malformed("peer ephemeral key is not a P-256 point"))?;

        let shared = self.secret.diffie_hellman(&peer_key);
        let (low_id, high_id) = if self.offer.public_id < peer.public_id {
            (self.offer.public_id, peer.public_id)
        } else {
            (peer.public_id, self.offer.public_id)
        };
        let mut salt = [0u8; 2 * PUBLIC_ID_SIZE];
        salt[..PUBLIC_ID_SIZE].copy_from_slice(&low_id);
        salt[PUBLIC_ID_SIZE..].copy_from_slice(&high_id);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(PAIRING_INFO, &mut key)
            .map_err(|e| SsError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;

        let mut pairing = PairingKey {
            key,
            low_id,
            high_id,
            low_signature: None,
            high_signature: None,
        };
        let own = identity.sign(&pairing.material());
        pairing.set_signature(identity.public_id(), own)?;
        debug!(peer = %fingerprint(&peer.public_id), "pairing key agreed");
        Ok(pairing)
    }
}

/// Shared symmetric key plus one HMAC signature per participant.
pub struct PairingKey {
    key: [u8; 32],
    low_id: [u8; PUBLIC_ID_SIZE],
    high_id: [u8; PUBLIC_ID_SIZE],
    low_signature: Option<[u8; 32]>,
    high_signature: Option<[u8; 32]>,
}

impl PairingKey {
    /// Bytes both sides sign. Commits to the key without revealing it.
    pub fn material(&self) -> Vec<u8> {
        let mut material = Vec::with_capacity(PAIRING_INFO.len() + 2 * PUBLIC_ID_SIZE + 32);
        material.extend_from_slice(PAIRING_INFO);
        material.extend_from_slice(&self.low_id);
        material.extend_from_slice(&self.high_id);
        material.extend_from_slice(&Sha256::digest(self.key));
        material
    }

    pub fn signature_of(&self, public_id: &[u8; PUBLIC_ID_SIZE]) -> Option<[u8; 32]> {
        if public_id == &self.low_id {
            self.low_signature
        } else if public_id == &self.high_id {
            self.high_signature
        } else {
            None
        }
    }

    /// Attach the signature a participant produced over [`PairingKey::material`].
    pub fn set_signature(&mut self, signer: &[u8; PUBLIC_ID_SIZE], signature: [u8; 32]) -> SsResult<()> {
        if signer == &self.low_id {
            self.low_signature = Some(signature);
        } else if signer == &self.high_id {
            self.high_signature = Some(signature);
        } else {
            return Err(SsError::SignatureInvalid(
                "signer is not a participant in this pairing".into(),
            ));
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.low_signature.is_some() && self.high_signature.is_some()
    }

    /// Check the caller's own signature. The peer's cannot be checked here.
    pub fn verify_own(&self, identity: &Identity) -> SsResult<()> {
        let signature = self.signature_of(identity.public_id()).ok_or_else(|| {
            SsError::SignatureInvalid("no signature for this identity".into())
        })?;
        if identity.verify(&self.material(), &signature) {
            Ok(())
        } else {
            warn!(identity = %identity.fingerprint(), "own pairing signature does not verify");
            Err(SsError::SignatureInvalid("pairing signature mismatch".into()))
        }
    }

    /// Fingerprint of the other participant, for out-of-band comparison.
    pub fn peer_fingerprint(&self, me: &[u8; PUBLIC_ID_SIZE]) -> String {
        if me == &self.low_id {
            fingerprint(&self.high_id)
        } else {
            fingerprint(&self.low_id)
        }
    }

    /// Secret fed to the transfer KDF in place of a PIN.
    pub fn transfer_secret(&self) -> SecretString {
        SecretString::from(hex::encode(self.key))
    }
}

impl Drop for PairingKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for PairingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingKey")
            .field("key", &"[REDACTED]")
            .field("low", &fingerprint(&self.low_id))
            .field("high", &fingerprint(&self.high_id))
            .field("complete", &self.is_complete())
            .finish()
    }
}
