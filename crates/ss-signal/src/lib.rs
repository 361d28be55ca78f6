//! ss-signal: connection negotiation for SecureSend
//!
//! Three interchangeable [`SignalingTransport`]s exchange offer, answer and
//! candidates, then carry the data channel:
//!
//! ```text
//!   relay   ── sealed+signed signals on a secret-derived topic, blob fallback
//!   broker  ── rendezvous on a secret-derived peer id, no fallback
//!   manual  ── descriptions shown and scanned as QR frames
//! ```
//!
//! The real-time connection itself sits behind [`PeerConnection`];
//! [`loopback`] provides an in-process one.

pub mod broker;
pub mod link;
pub mod loopback;
pub mod manual;
pub mod memory;
pub mod nats;
pub mod peer;
pub mod relay;
pub mod transport;

pub use broker::{derive_peer_id, BrokerClient, BrokerOptions, BrokerTransport};
pub use link::PeerLink;
pub use loopback::{LoopbackNetwork, LoopbackPeer};
pub use manual::{ManualOptions, ManualTransport};
pub use memory::{MemoryBroker, MemoryBrokerHub, MemoryRelay, MemoryRelayHub};
pub use peer::{ChannelMessage, PeerConnection, PeerEvent};
pub use relay::{topic_for, RelayClient, RelayOptions, RelayTransport};
pub use transport::{Capabilities, LinkMode, OfferContext, Signal, SignalingTransport};
