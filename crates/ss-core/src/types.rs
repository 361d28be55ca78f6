use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{SsError, SsResult, MAX_PAYLOAD, SALT_SIZE};

/// Which signaling channel a transfer negotiates over.
///
/// Selected by the first character of the PIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMethod {
    /// Decentralized message relay (uppercase indicator)
    Relay,
    /// Hosted peer broker (lowercase indicator)
    CloudBroker,
    /// Offer/answer exchanged by scanning or pasting QR payloads (indicator `2`)
    Manual,
}

impl std::fmt::Display for TransportMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportMethod::Relay => "relay",
            TransportMethod::CloudBroker => "cloud",
            TransportMethod::Manual => "manual",
        })
    }
}

impl std::str::FromStr for TransportMethod {
    type Err = SsError;

    fn from_str(s: &str) -> SsResult<Self> {
        match s {
            "relay" => Ok(TransportMethod::Relay),
            "cloud" | "broker" => Ok(TransportMethod::CloudBroker),
            "manual" | "qr" => Ok(TransportMethod::Manual),
            other => Err(SsError::Config(format!("unknown transport method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    File,
}

/// Describes a transfer before any ciphertext is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub content_type: ContentType,
    pub total_bytes: u64,
    pub chunk_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Unix milliseconds at which the sender created the transfer
    pub created_at: u64,
    #[serde(with = "b64::salt")]
    pub salt: [u8; SALT_SIZE],
}

impl TransferMetadata {
    /// Receiver-side checks, run before the first chunk is decrypted.
    pub fn validate(&self, expected_salt: &[u8; SALT_SIZE], ttl: Duration, now_ms: u64) -> SsResult<()> {
        if self.total_bytes > MAX_PAYLOAD {
            return Err(SsError::SizeLimitExceeded {
                size: self.total_bytes,
                limit: MAX_PAYLOAD,
            });
        }
        if self.created_at.saturating_add(ttl.as_millis() as u64) < now_ms {
            return Err(SsError::Expired);
        }
        if &self.salt != expected_salt {
            return Err(SsError::malformed("metadata salt differs from the negotiated salt"));
        }
        if (self.total_bytes == 0) != (self.chunk_count == 0)
            || u64::from(self.chunk_count) > self.total_bytes.max(1)
        {
            return Err(SsError::malformed(format!(
                "{} chunks cannot carry {} bytes",
                self.chunk_count, self.total_bytes
            )));
        }
        if self.content_type == ContentType::File && self.file_name.is_none() {
            return Err(SsError::malformed("file transfer without a file name"));
        }
        Ok(())
    }
}

/// A single trickled or gathered ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// Offer or answer exchanged during negotiation.
///
/// Only offers carry the salt and content preview fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingPayload {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sdp: String,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::opt_salt")]
    pub salt: Option<[u8; SALT_SIZE]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl SignalingPayload {
    pub fn answer(sdp: impl Into<String>, candidates: Vec<IceCandidate>) -> Self {
        Self {
            kind: SignalKind::Answer,
            sdp: sdp.into(),
            candidates,
            salt: None,
            content_type: None,
            file_name: None,
            file_size: None,
            mime_type: None,
            total_bytes: None,
        }
    }

    pub fn offer(sdp: impl Into<String>, candidates: Vec<IceCandidate>, salt: [u8; SALT_SIZE]) -> Self {
        Self {
            kind: SignalKind::Offer,
            salt: Some(salt),
            ..Self::answer(sdp, candidates)
        }
    }

    /// Copy the preview fields an offer advertises from the transfer metadata.
    pub fn with_preview(mut self, meta: &TransferMetadata) -> Self {
        self.content_type = Some(meta.content_type);
        self.file_name = meta.file_name.clone();
        self.file_size = meta.file_size;
        self.mime_type = meta.mime_type.clone();
        self.total_bytes = Some(meta.total_bytes);
        self
    }

    fn has_content_fields(&self) -> bool {
        self.salt.is_some()
            || self.content_type.is_some()
            || self.file_name.is_some()
            || self.file_size.is_some()
            || self.mime_type.is_some()
            || self.total_bytes.is_some()
    }

    /// Enforce the offer/answer field rules.
    pub fn validate(&self) -> SsResult<()> {
        match self.kind {
            SignalKind::Answer if self.has_content_fields() => Err(SsError::malformed(
                "answer must not carry salt or content metadata",
            )),
            SignalKind::Offer if self.salt.is_none() => {
                Err(SsError::malformed("offer is missing its salt"))
            }
            _ if self.sdp.is_empty() => Err(SsError::malformed("empty session description")),
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> SsResult<String> {
        serde_json::to_string(self).map_err(|e| SsError::malformed(format!("encoding signal: {e}")))
    }

    pub fn from_json(text: &str) -> SsResult<Self> {
        let payload: Self = serde_json::from_str(text)
            .map_err(|e| SsError::malformed(format!("decoding signal: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }
}

/// Serde helpers for base64 salts.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};

    fn to_salt<E: serde::de::Error>(text: &str) -> Result<[u8; crate::SALT_SIZE], E> {
        let bytes = STANDARD.decode(text).map_err(E::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| E::custom(format!("salt must be 16 bytes, got {}", v.len())))
    }

    pub mod salt {
        use super::*;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(salt: &[u8; crate::SALT_SIZE], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&STANDARD.encode(salt))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; crate::SALT_SIZE], D::Error> {
            let text = String::deserialize(d)?;
            to_salt(&text)
        }
    }

    pub mod opt_salt {
        use super::*;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            salt: &Option<[u8; crate::SALT_SIZE]>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match salt {
                Some(salt) => s.serialize_some(&STANDARD.encode(salt)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<[u8; crate::SALT_SIZE]>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|text| to_salt(&text))
                .transpose()
        }
    }
}
