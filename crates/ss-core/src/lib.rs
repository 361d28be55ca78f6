//! ss-core: types, configuration and error kinds shared by every SecureSend crate

pub mod config;
pub mod error;
pub mod types;

pub use error::{SsError, SsResult, Stage};
pub use types::{ContentType, IceCandidate, SignalKind, SignalingPayload, TransferMetadata, TransportMethod};

/// Length of the per-transfer salt in bytes
pub const SALT_SIZE: usize = 16;

/// Largest payload accepted by any decrypt path (100 MiB)
pub const MAX_PAYLOAD: u64 = 100 * 1024 * 1024;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
