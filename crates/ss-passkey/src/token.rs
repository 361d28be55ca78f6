//! Contact tokens: offline-verifiable, passkey-signed identity cards
//!
//! Text form:
//! ```text
//! sswct-es256 <base64(JSON)> [comment]
//! JSON = { sub, cpk, iat, authData, clientDataJSON, sig }
//! challenge = SHA-256(sub ∥ cpk ∥ iat as u64 BE)
//! ```
//! `sub` and `cpk` are standard base64; the WebAuthn fields are base64url.
//! Decoding accepts either alphabet, padded or not.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use ss_core::{SsError, SsResult};

use crate::authenticator::Authenticator;
use crate::der::der_to_raw;
use crate::identity::{check_public_key, fingerprint};
use crate::{PUBLIC_ID_SIZE, PUBLIC_KEY_SIZE};

pub const TOKEN_PREFIX: &str = "sswct-es256";

/// Wire form of the token payload.
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    sub: String,
    cpk: String,
    iat: u64,
    #[serde(rename = "authData")]
    auth_data: String,
    #[serde(rename = "clientDataJSON")]
    client_data_json: String,
    sig: String,
}

/// A decoded, size-checked, not yet verified contact token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactToken {
    pub sub: [u8; PUBLIC_ID_SIZE],
    pub cpk: [u8; PUBLIC_KEY_SIZE],
    pub iat: u64,
    pub auth_data: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub sig: Vec<u8>,
    pub comment: Option<String>,
}

/// What a successfully verified token vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedContact {
    pub sub: [u8; PUBLIC_ID_SIZE],
    pub cpk: [u8; PUBLIC_KEY_SIZE],
    pub iat: u64,
    pub fingerprint: String,
    pub comment: Option<String>,
}

/// Challenge a token's assertion must sign.
pub fn expected_challenge(sub: &[u8; PUBLIC_ID_SIZE], cpk: &[u8; PUBLIC_KEY_SIZE], iat: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sub);
    hasher.update(cpk);
    hasher.update(iat.to_be_bytes());
    hasher.finalize().into()
}

fn decode_any(field: &str, text: &str) -> SsResult<Vec<u8>> {
    [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(text).ok())
        .ok_or_else(|| SsError::malformed(format!("{field} is not valid base64")))
}

impl ContactToken {
    /// Steps 1 and 2: token shape, then field sizes.
    pub fn parse(text: &str) -> SsResult<Self> {
        let mut parts = text.trim().splitn(3, ' ');
        if parts.next() != Some(TOKEN_PREFIX) {
            return Err(SsError::malformed(format!(
                "contact token must start with '{TOKEN_PREFIX}'"
            )));
        }
        let encoded = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SsError::malformed("contact token has no payload"))?;
        let comment = parts.next().map(str::trim).filter(|c| !c.is_empty()).map(String::from);

        let json = decode_any("payload", encoded)?;
        let payload: TokenPayload = serde_json::from_slice(&json)
            .map_err(|e| SsError::malformed(format!("contact token JSON: {e}")))?;

        let sub: [u8; PUBLIC_ID_SIZE] = decode_any("sub", &payload.sub)?
            .try_into()
            .map_err(|v: Vec<u8>| {
                SsError::malformed(format!("sub must be {PUBLIC_ID_SIZE} bytes, got {}", v.len()))
            })?;
        let cpk_bytes = decode_any("cpk", &payload.cpk)?;
        check_public_key(&cpk_bytes)?;
        let mut cpk = [0u8; PUBLIC_KEY_SIZE];
        cpk.copy_from_slice(&cpk_bytes);

        Ok(Self {
            sub,
            cpk,
            iat: payload.iat,
            auth_data: decode_any("authData", &payload.auth_data)?,
            client_data_json: decode_any("clientDataJSON", &payload.client_data_json)?,
            sig: decode_any("sig", &payload.sig)?,
            comment,
        })
    }

    pub fn encode(&self) -> SsResult<String> {
        let payload = TokenPayload {
            sub: STANDARD.encode(self.sub),
            cpk: STANDARD.encode(self.cpk),
            iat: self.iat,
            auth_data: URL_SAFE_NO_PAD.encode(&self.auth_data),
            client_data_json: URL_SAFE_NO_PAD.encode(&self.client_data_json),
            sig: URL_SAFE_NO_PAD.encode(&self.sig),
        };
        let json = serde_json::to_vec(&payload)
            .map_err(|e| SsError::malformed(format!("encoding contact token: {e}")))?;
        let mut text = format!("{TOKEN_PREFIX} {}", STANDARD.encode(json));
        if let Some(comment) = &self.comment {
            text.push(' ');
            text.push_str(comment);
        }
        Ok(text)
    }

    /// Steps 3 to 6: challenge binding, assertion type, DER conversion, ECDSA.
    pub fn verify(&self) -> SsResult<VerifiedContact> {
        let client: serde_json::Value = serde_json::from_slice(&self.client_data_json)
            .map_err(|e| SsError::malformed(format!("clientDataJSON: {e}")))?;

        let embedded = client
            .get("challenge")
            .and_then(|c| c.as_str())
            .ok_or_else(|| SsError::malformed("clientDataJSON has no challenge"))
            .and_then(|c| decode_any("challenge", c))?;
        if embedded != expected_challenge(&self.sub, &self.cpk, self.iat) {
            warn!(subject = %fingerprint(&self.sub), "contact token challenge mismatch");
            return Err(SsError::ChallengeMismatch);
        }

        if client.get("type").and_then(|t| t.as_str()) != Some("webauthn.get") {
            return Err(SsError::SignatureInvalid(
                "clientDataJSON type is not webauthn.get".into(),
            ));
        }

        let raw = der_to_raw(&self.sig)?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| SsError::SignatureInvalid(format!("signature scalars: {e}")))?;
        let key = VerifyingKey::from_sec1_bytes(&self.cpk)
            .map_err(|e| SsError::SignatureInvalid(format!("signer key: {e}")))?;

        let mut signed = self.auth_data.clone();
        signed.extend_from_slice(&Sha256::digest(&self.client_data_json));
        key.verify(&signed, &signature)
            .map_err(|_| SsError::SignatureInvalid("ECDSA verification failed".into()))?;

        debug!(subject = %fingerprint(&self.sub), "contact token verified");
        Ok(VerifiedContact {
            sub: self.sub,
            cpk: self.cpk,
            iat: self.iat,
            fingerprint: fingerprint(&self.cpk),
            comment: self.comment.clone(),
        })
    }
}

/// Issue a token vouching for `sub`, signed by the authenticator's credential.
pub async fn issue_contact_token<A: Authenticator + ?Sized>(
    authenticator: &A,
    sub: &[u8; PUBLIC_ID_SIZE],
    iat: u64,
    comment: Option<&str>,
) -> SsResult<String> {
    let cpk = authenticator.public_key();
    let challenge = expected_challenge(sub, &cpk, iat);
    let assertion = authenticator.get_assertion(&challenge).await?;

    ContactToken {
        sub: *sub,
        cpk,
        iat,
        auth_data: assertion.authenticator_data,
        client_data_json: assertion.client_data_json,
        sig: assertion.signature,
        comment: comment.map(String::from),
    }
    .encode()
}

/// Parse and fully verify a token's text form.
pub fn verify_contact_token(text: &str) -> SsResult<VerifiedContact> {
    ContactToken::parse(text)?.verify()
}
