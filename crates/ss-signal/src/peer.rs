//! Real-time transport capability
//!
//! ICE, DTLS and SCTP live behind [`PeerConnection`]; this crate only drives
//! descriptions, candidates and one data channel through it.

use async_trait::async_trait;
use bytes::Bytes;

use ss_core::{IceCandidate, SignalKind, SsResult};

/// One data channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(t) => t.len(),
            ChannelMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate to hand to the counterpart
    LocalCandidate(IceCandidate),
    GatheringComplete,
    ChannelOpen,
    Message(ChannelMessage),
    Closed,
    Failed(String),
}

#[async_trait]
pub trait PeerConnection: Send {
    /// Create an offer and install it as the local description.
    async fn create_offer(&mut self) -> SsResult<String>;

    /// Create an answer to the applied remote offer and install it locally.
    async fn create_answer(&mut self) -> SsResult<String>;

    async fn set_remote_description(&mut self, kind: SignalKind, sdp: &str) -> SsResult<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> SsResult<()>;

    async fn send(&mut self, message: ChannelMessage) -> SsResult<()>;

    /// Bytes queued on the data channel but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Next event; `None` once the connection has been torn down.
    ///
    /// Must be cancel-safe: it is raced against other sources in `select!`.
    async fn next_event(&mut self) -> Option<PeerEvent>;

    async fn close(&mut self);
}
