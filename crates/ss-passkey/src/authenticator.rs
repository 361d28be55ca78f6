//! Platform authenticator seam
//!
//! A real deployment talks to a WebAuthn authenticator; [`SoftAuthenticator`]
//! holds the credential in memory and produces byte-identical assertion
//! structures for tests and tooling.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use ss_core::{SsError, SsResult};

use crate::identity::MasterKey;
use crate::PUBLIC_KEY_SIZE;

/// authData flags: user present | user verified
const FLAGS_UP_UV: u8 = 0x05;

/// Raw WebAuthn assertion output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub authenticator_data: Vec<u8>,
    pub client_data_json: Vec<u8>,
    /// DER-encoded ECDSA P-256 signature over `authData ∥ SHA-256(clientDataJSON)`
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The credential's uncompressed SEC1 public key.
    fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE];

    /// Evaluate the PRF extension for `salt`, yielding the master key.
    async fn master_key(&self, salt: &[u8]) -> SsResult<MasterKey>;

    /// Run an assertion (`webauthn.get`) over `challenge`.
    async fn get_assertion(&self, challenge: &[u8]) -> SsResult<Assertion>;
}

/// In-memory credential.
pub struct SoftAuthenticator {
    signing_key: SigningKey,
    prf_secret: [u8; 32],
    rp_id: String,
    origin: String,
    sign_count: AtomicU32,
}

impl SoftAuthenticator {
    pub fn generate(rp_id: impl Into<String>) -> Self {
        let mut prf_secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut prf_secret);
        Self::from_parts(
            SigningKey::random(&mut rand::rngs::OsRng),
            prf_secret,
            rp_id,
        )
    }

    pub fn from_parts(signing_key: SigningKey, prf_secret: [u8; 32], rp_id: impl Into<String>) -> Self {
        let rp_id = rp_id.into();
        Self {
            signing_key,
            prf_secret,
            origin: format!("https://{rp_id}"),
            rp_id,
            sign_count: AtomicU32::new(0),
        }
    }

    fn authenticator_data(&self) -> Vec<u8> {
        let count = self.sign_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&Sha256::digest(self.rp_id.as_bytes()));
        data.push(FLAGS_UP_UV);
        data.extend_from_slice(&count.to_be_bytes());
        data
    }
}

impl Drop for SoftAuthenticator {
    fn drop(&mut self) {
        self.prf_secret.zeroize();
    }
}

#[async_trait]
impl Authenticator for SoftAuthenticator {
    fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    async fn master_key(&self, salt: &[u8]) -> SsResult<MasterKey> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.prf_secret)
            .map_err(|e| SsError::Other(anyhow::anyhow!("PRF key rejected: {e}")))?;
        mac.update(b"WebAuthn PRF\0");
        mac.update(salt);
        Ok(MasterKey::from_prf_output(mac.finalize().into_bytes().into()))
    }

    async fn get_assertion(&self, challenge: &[u8]) -> SsResult<Assertion> {
        let client_data = serde_json::json!({
            "type": "webauthn.get",
            "challenge": URL_SAFE_NO_PAD.encode(challenge),
            "origin": self.origin,
            "crossOrigin": false,
        });
        let client_data_json = serde_json::to_vec(&client_data)
            .map_err(|e| SsError::malformed(format!("encoding clientDataJSON: {e}")))?;
        let authenticator_data = self.authenticator_data();

        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&Sha256::digest(&client_data_json));
        let signature: Signature = self.signing_key.sign(&signed);

        tracing::debug!(rp_id = %self.rp_id, "soft authenticator produced assertion");
        Ok(Assertion {
            authenticator_data,
            client_data_json,
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }
}
