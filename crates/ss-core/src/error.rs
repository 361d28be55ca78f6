use thiserror::Error;

pub type SsResult<T> = Result<T, SsError>;

/// Protocol stage a timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Metadata,
    Transfer,
    Acknowledgment,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Connect => "connection",
            Stage::Metadata => "metadata",
            Stage::Transfer => "transfer",
            Stage::Acknowledgment => "acknowledgment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SsError {
    #[error("invalid PIN: {0}")]
    InvalidPin(String),

    /// Wrong secret and tampered ciphertext are deliberately the same error.
    #[error("authentication failed: wrong PIN or corrupted data")]
    AuthenticationFailed,

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("timed out during {stage}")]
    TransportTimeout { stage: Stage },

    #[error("challenge mismatch: token contents were altered after signing")]
    ChallengeMismatch,

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("reassembled QR payload failed its checksum")]
    PayloadChecksumMismatch,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("transfer expired")]
    Expired,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("a transfer is already running on this session")]
    Busy,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SsError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        SsError::MalformedPayload(msg.into())
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        SsError::Transport(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_names_stage() {
        let err = SsError::TransportTimeout {
            stage: Stage::Metadata,
        };
        assert_eq!(err.to_string(), "timed out during metadata");
    }

    #[test]
    fn every_stage_has_a_timeout_message() {
        let names: Vec<String> = [Stage::Connect, Stage::Metadata, Stage::Transfer, Stage::Acknowledgment]
            .into_iter()
            .map(|stage| SsError::TransportTimeout { stage }.to_string())
            .collect();
        assert_eq!(
            names,
            [
                "timed out during connection",
                "timed out during metadata",
                "timed out during transfer",
                "timed out during acknowledgment",
            ]
        );
    }

    #[test]
    fn auth_failure_message_does_not_say_which() {
        let msg = SsError::AuthenticationFailed.to_string();
        assert!(msg.contains("wrong PIN or corrupted data"));
    }
}
