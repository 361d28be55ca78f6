use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{SsError, SsResult};

/// Top-level configuration (loaded from securesend.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureSendConfig {
    pub log: LogConfig,
    pub kdf: KdfConfig,
    pub transfer: TransferConfig,
    pub relay: RelayConfig,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub qr: QrConfig,
    pub backpressure: BackpressureConfig,
}

impl SecureSendConfig {
    /// Parse a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> SsResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| SsError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// PBKDF2-HMAC-SHA256 rounds (default: 600000)
    pub iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Time allowed to reach an open data channel
    pub connect_timeout_secs: u64,
    /// Time the receiver waits for metadata once connected
    pub metadata_timeout_secs: u64,
    /// Time allowed for the bulk transfer including the final ack
    pub transfer_timeout_secs: u64,
    /// How long a PIN / transfer stays valid
    pub pin_ttl_secs: u64,
    /// Plaintext bytes per encrypted chunk
    pub chunk_size: usize,
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn pin_ttl(&self) -> Duration {
        Duration::from_secs(self.pin_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// NATS endpoint used as the signaling relay
    pub nats_url: String,
    /// Subject prefix for per-transfer signaling topics
    pub subject_prefix: String,
    /// How long to wait for a direct channel before falling back to blob storage
    pub channel_open_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Prefix prepended to derived peer ids
    pub peer_id_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint for relay fallback blobs
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket for fallback blobs
    pub bucket: String,
    /// Key prefix for fallback blobs
    pub prefix: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    /// Characters of encoded payload per QR frame
    pub frame_capacity: usize,
    /// Upper bound on local ICE gathering before the offer is rendered
    pub gather_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Stop enqueueing once the channel buffers more than this many bytes
    pub threshold_bytes: usize,
    /// Poll interval while waiting for the buffer to drain
    pub poll_interval_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self { iterations: 600_000 }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            metadata_timeout_secs: 30,
            transfer_timeout_secs: 600,
            pin_ttl_secs: 600,
            chunk_size: 256 * 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".into(),
            subject_prefix: "securesend.signal".into(),
            channel_open_timeout_secs: 15,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            peer_id_prefix: "ss-".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "securesend".into(),
            prefix: "fallback".into(),
            enforce_tls: false,
        }
    }
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 1000,
            gather_timeout_secs: 10,
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024 * 1024,
            poll_interval_ms: 10,
        }
    }
}
