//! The interface the transfer state machine drives, whatever the channel.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ss_core::{IceCandidate, SignalingPayload, SsResult, TransferMetadata, TransportMethod, SALT_SIZE};

use crate::peer::ChannelMessage;

/// What a transport can do beyond the common interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Can move bulk data through blob storage if no direct channel opens
    pub blob_fallback: bool,
    /// Candidates are exchanged incrementally rather than bundled with the
    /// description
    pub trickle_ice: bool,
}

/// How a connected transport moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Peer-to-peer data channel
    Direct,
    /// Control over the signaling relay, bulk data through blob storage
    Fallback,
}

/// What the sender advertises in its offer.
#[derive(Debug, Clone)]
pub struct OfferContext {
    pub salt: [u8; SALT_SIZE],
    pub preview: Option<TransferMetadata>,
}

impl OfferContext {
    pub fn payload(&self, sdp: String, candidates: Vec<IceCandidate>) -> SignalingPayload {
        let offer = SignalingPayload::offer(sdp, candidates, self.salt);
        match &self.preview {
            Some(meta) => offer.with_preview(meta),
            None => offer,
        }
    }
}

/// A unit of signaling traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Description { payload: SignalingPayload },
    Candidate { candidate: IceCandidate },
    /// Joiner asks the host to start negotiating (broker)
    Knock { peer_id: String },
    /// Sender gave up on a direct channel (relay)
    Fallback,
    /// Control text carried over the relay while in fallback
    Control { text: String },
    /// Binary frames uploaded as one blob (relay fallback)
    Bundle { locator: String, frames: u32 },
    Bye,
}

impl Signal {
    pub fn to_bytes(&self) -> SsResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ss_core::SsError::malformed(format!("encoding signal: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> SsResult<Self> {
        let signal: Self = serde_json::from_slice(data)
            .map_err(|e| ss_core::SsError::malformed(format!("decoding signal: {e}")))?;
        if let Signal::Description { payload } = &signal {
            payload.validate()?;
        }
        Ok(signal)
    }
}

/// One negotiation channel plus the data path it yields.
///
/// Sender: `offer` → `await_answer` → `wait_connected` → `send*` → `recv` (ack).
/// Receiver: `await_offer` → `answer` → `wait_connected` → `recv*` → `send` (ack).
#[async_trait]
pub trait SignalingTransport: Send {
    fn method(&self) -> TransportMethod;

    fn capabilities(&self) -> Capabilities;

    /// Create the offer and publish it to the counterpart.
    async fn offer(&mut self, ctx: &OfferContext) -> SsResult<()>;

    /// Wait for the counterpart's answer and apply it.
    async fn await_answer(&mut self) -> SsResult<()>;

    /// Wait for and apply the counterpart's offer; returns it for the salt
    /// and content preview.
    async fn await_offer(&mut self) -> SsResult<SignalingPayload>;

    /// Create the answer and publish it.
    async fn answer(&mut self) -> SsResult<()>;

    /// Apply one inbound signal.
    async fn handle_signal(&mut self, signal: Signal) -> SsResult<()>;

    /// Resolve once data can flow, reporting which path it takes.
    async fn wait_connected(&mut self) -> SsResult<LinkMode>;

    async fn send(&mut self, message: ChannelMessage) -> SsResult<()>;

    async fn send_with_backpressure(&mut self, data: Bytes) -> SsResult<()>;

    /// Next inbound message; `None` when the counterpart is gone.
    async fn recv(&mut self) -> SsResult<Option<ChannelMessage>>;

    /// Release every resource. Safe to call more than once.
    async fn close(&mut self);
}
