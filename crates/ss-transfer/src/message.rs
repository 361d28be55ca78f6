//! Control messages on the data channel
//!
//! Text frames carry JSON control messages; binary frames carry encrypted
//! chunks (`ss_crypto::EncryptedChunk::to_frame`).
//! ```text
//! sender                          receiver
//!   ── {"type":"metadata",...} ──▶
//!   ── chunk frames ────────────▶
//!   ── {"type":"done"} ─────────▶
//!   ◀── {"type":"done_ack"} ─────   (after every chunk verified)
//! ```

use serde::{Deserialize, Serialize};

use ss_core::{SsError, SsResult, TransferMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Metadata { metadata: TransferMetadata },
    Done,
    DoneAck,
    /// The other side cancelled
    Cancel,
    /// The other side failed; the reason is for display only
    Abort { reason: String },
}

impl ControlMessage {
    pub fn to_text(&self) -> SsResult<String> {
        serde_json::to_string(self)
            .map_err(|e| SsError::malformed(format!("encoding control message: {e}")))
    }

    pub fn from_text(text: &str) -> SsResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SsError::malformed(format!("decoding control message: {e}")))
    }
}
