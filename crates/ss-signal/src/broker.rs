//! Cloud peer broker transport
//!
//! The host registers a peer id derived from the shared secret; the joiner
//! registers a random id and knocks on the derived one. Once the host hears
//! the knock it sends its offer, and from then on the two exchange signals
//! point to point. There is no fallback: if the data channel fails the
//! session fails.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use ss_core::config::{BackpressureConfig, SecureSendConfig};
use ss_core::{SignalKind, SignalingPayload, SsError, SsResult, TransportMethod};

use crate::link::PeerLink;
use crate::peer::{ChannelMessage, PeerConnection, PeerEvent};
use crate::transport::{Capabilities, LinkMode, OfferContext, Signal, SignalingTransport};

/// Point-to-point messaging through a broker that routes by peer id.
#[async_trait]
pub trait BrokerClient: Send {
    /// Claim `id`. Fails if another live client holds it.
    async fn register(&mut self, id: &str) -> SsResult<()>;

    async fn send_to(&mut self, peer: &str, payload: Vec<u8>) -> SsResult<()>;

    /// Next `(sender id, payload)`. Must be cancel-safe.
    async fn next_message(&mut self) -> Option<(String, Vec<u8>)>;

    async fn close(&mut self);
}

/// Rendezvous id both holders of `secret` compute independently.
pub fn derive_peer_id(secret: &SecretString, prefix: &str) -> String {
    let digest = Sha256::new()
        .chain_update(b"securesend-peer-id-v1")
        .chain_update(secret.expose_secret().as_bytes())
        .finalize();
    format!("{prefix}{}", &hex::encode(digest)[..24])
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub peer_id_prefix: String,
    /// How often the joiner repeats its knock while the host is absent
    pub knock_interval: Duration,
    pub backpressure: BackpressureConfig,
}

impl BrokerOptions {
    pub fn from_config(cfg: &SecureSendConfig) -> Self {
        Self {
            peer_id_prefix: cfg.broker.peer_id_prefix.clone(),
            backpressure: cfg.backpressure.clone(),
            ..Self::default()
        }
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            peer_id_prefix: "ss-".into(),
            knock_interval: Duration::from_secs(1),
            backpressure: BackpressureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Joiner,
}

pub struct BrokerTransport<B: BrokerClient> {
    broker: B,
    link: PeerLink,
    role: Role,
    own_id: String,
    counterpart: Option<String>,
    knock_interval: Duration,
    offer: Option<SignalingPayload>,
    offer_sent: bool,
    answered: bool,
    remote_offer: Option<SignalingPayload>,
    link_done: bool,
    failure: Option<String>,
    peer_gone: bool,
    closed: bool,
}

impl<B: BrokerClient> BrokerTransport<B> {
    /// Register under the secret-derived id and wait for a knock.
    pub async fn host(
        mut broker: B,
        peer: Box<dyn PeerConnection>,
        secret: &SecretString,
        options: BrokerOptions,
    ) -> SsResult<Self> {
        let own_id = derive_peer_id(secret, &options.peer_id_prefix);
        broker.register(&own_id).await?;
        info!(peer_id = %own_id, "registered with broker");
        Ok(Self::build(broker, peer, Role::Host, own_id, None, options))
    }

    /// Register under a random id and knock on the secret-derived one.
    pub async fn join(
        mut broker: B,
        peer: Box<dyn PeerConnection>,
        secret: &SecretString,
        options: BrokerOptions,
    ) -> SsResult<Self> {
        let host_id = derive_peer_id(secret, &options.peer_id_prefix);
        let own_id = format!("{}{}", options.peer_id_prefix, uuid::Uuid::new_v4().simple());
        broker.register(&own_id).await?;
        debug!(peer_id = %own_id, host = %host_id, "joined broker");
        Ok(Self::build(broker, peer, Role::Joiner, own_id, Some(host_id), options))
    }

    fn build(
        broker: B,
        peer: Box<dyn PeerConnection>,
        role: Role,
        own_id: String,
        counterpart: Option<String>,
        options: BrokerOptions,
    ) -> Self {
        Self {
            broker,
            link: PeerLink::new(peer, &options.backpressure),
            role,
            own_id,
            counterpart,
            knock_interval: options.knock_interval,
            offer: None,
            offer_sent: false,
            answered: false,
            remote_offer: None,
            link_done: false,
            failure: None,
            peer_gone: false,
            closed: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.own_id
    }

    async fn send_signal(&mut self, signal: &Signal) -> SsResult<()> {
        let Some(peer) = self.counterpart.clone() else {
            return Ok(());
        };
        self.broker.send_to(&peer, signal.to_bytes()?).await
    }

    async fn send_offer(&mut self) -> SsResult<()> {
        let Some(offer) = &self.offer else {
            return Ok(());
        };
        let mut payload = offer.clone();
        payload.candidates = self.link.local_candidates().to_vec();
        self.send_signal(&Signal::Description { payload }).await?;
        self.offer_sent = true;
        debug!("offer sent through broker");
        Ok(())
    }

    async fn knock(&mut self) -> SsResult<()> {
        let knock = Signal::Knock {
            peer_id: self.own_id.clone(),
        };
        match self.send_signal(&knock).await {
            Ok(()) => Ok(()),
            Err(SsError::Transport(reason)) => {
                trace!(%reason, "host not reachable yet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_broker_message(&mut self, message: Option<(String, Vec<u8>)>) -> SsResult<()> {
        let (from, data) = message.ok_or_else(|| SsError::transport("broker connection closed"))?;
        if self.counterpart.as_ref().is_some_and(|c| c != &from) {
            warn!(%from, "ignoring broker message from a third peer");
            return Ok(());
        }
        match Signal::from_bytes(&data) {
            Ok(signal) => {
                if self.counterpart.is_none() {
                    if !matches!(signal, Signal::Knock { .. }) {
                        trace!(%from, "ignoring signal before any knock");
                        return Ok(());
                    }
                    self.counterpart = Some(from);
                }
                self.handle_signal(signal).await
            }
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed broker message");
                Ok(())
            }
        }
    }

    async fn on_peer_event(&mut self, event: Option<PeerEvent>) -> SsResult<()> {
        match event {
            Some(PeerEvent::LocalCandidate(candidate)) => {
                let described = match self.role {
                    Role::Host => self.offer_sent,
                    Role::Joiner => self.link.has_remote_description(),
                };
                if described {
                    self.send_signal(&Signal::Candidate { candidate }).await?;
                }
            }
            Some(PeerEvent::Failed(reason)) => {
                self.failure = Some(reason);
                self.link_done = true;
            }
            Some(PeerEvent::Closed) | None => self.link_done = true,
            Some(_) => {}
        }
        Ok(())
    }

    fn check_failed(&self) -> SsResult<()> {
        match &self.failure {
            Some(reason) => Err(SsError::Transport(format!("peer connection failed: {reason}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<B: BrokerClient> SignalingTransport for BrokerTransport<B> {
    fn method(&self) -> TransportMethod {
        TransportMethod::CloudBroker
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            blob_fallback: false,
            trickle_ice: true,
        }
    }

    async fn offer(&mut self, ctx: &OfferContext) -> SsResult<()> {
        if self.role != Role::Host {
            return Err(SsError::transport("only the broker host sends the offer"));
        }
        let sdp = self.link.create_offer().await?;
        self.offer = Some(ctx.payload(sdp, Vec::new()));
        if self.counterpart.is_some() {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn await_answer(&mut self) -> SsResult<()> {
        while !self.answered {
            self.check_failed()?;
            tokio::select! {
                message = self.broker.next_message() => self.on_broker_message(message).await?,
                event = self.link.poll_event(), if !self.link_done => self.on_peer_event(event).await?,
            }
        }
        Ok(())
    }

    async fn await_offer(&mut self) -> SsResult<SignalingPayload> {
        if self.role != Role::Joiner {
            return Err(SsError::transport("the broker host does not receive offers"));
        }
        let mut knock = tokio::time::interval(self.knock_interval);
        loop {
            if let Some(offer) = &self.remote_offer {
                return Ok(offer.clone());
            }
            tokio::select! {
                message = self.broker.next_message() => self.on_broker_message(message).await?,
                _ = knock.tick() => self.knock().await?,
            }
        }
    }

    async fn answer(&mut self) -> SsResult<()> {
        let sdp = self.link.create_answer().await?;
        let payload = SignalingPayload::answer(sdp, self.link.local_candidates().to_vec());
        self.send_signal(&Signal::Description { payload }).await?;
        debug!("answer sent through broker");
        Ok(())
    }

    async fn handle_signal(&mut self, signal: Signal) -> SsResult<()> {
        match signal {
            Signal::Knock { peer_id } => {
                if self.role == Role::Host && !self.offer_sent {
                    info!(%peer_id, "peer knocked");
                    self.send_offer().await?;
                }
            }
            Signal::Description { payload } => match (payload.kind, self.role) {
                (SignalKind::Offer, Role::Joiner) if self.remote_offer.is_none() => {
                    self.link.set_remote_description(SignalKind::Offer, &payload.sdp).await?;
                    for candidate in payload.candidates.iter().cloned() {
                        self.link.add_remote_candidate(candidate).await?;
                    }
                    self.remote_offer = Some(payload);
                }
                (SignalKind::Answer, Role::Host) if !self.answered => {
                    self.link.set_remote_description(SignalKind::Answer, &payload.sdp).await?;
                    for candidate in payload.candidates {
                        self.link.add_remote_candidate(candidate).await?;
                    }
                    self.answered = true;
                }
                (kind, _) => trace!(?kind, "ignoring repeated or misdirected description"),
            },
            Signal::Candidate { candidate } => self.link.add_remote_candidate(candidate).await?,
            Signal::Bye => self.peer_gone = true,
            other => trace!(?other, "signal not used on the broker"),
        }
        Ok(())
    }

    async fn wait_connected(&mut self) -> SsResult<LinkMode> {
        loop {
            self.check_failed()?;
            if self.link.is_open() {
                info!("direct data channel established");
                return Ok(LinkMode::Direct);
            }
            if self.link_done || self.peer_gone {
                return Err(SsError::transport("peer connection closed before the channel opened"));
            }
            tokio::select! {
                message = self.broker.next_message() => self.on_broker_message(message).await?,
                event = self.link.poll_event() => self.on_peer_event(event).await?,
            }
        }
    }

    async fn send(&mut self, message: ChannelMessage) -> SsResult<()> {
        self.link.send(message).await
    }

    async fn send_with_backpressure(&mut self, data: Bytes) -> SsResult<()> {
        self.link.send_with_backpressure(data).await
    }

    async fn recv(&mut self) -> SsResult<Option<ChannelMessage>> {
        loop {
            if let Some(message) = self.link.take_buffered() {
                return Ok(Some(message));
            }
            self.check_failed()?;
            if self.link_done {
                return Ok(None);
            }
            // Broker traffic is ignored here; the channel's own close ends the stream.
            tokio::select! {
                message = self.broker.next_message() => {
                    if message.is_none() {
                        trace!("broker connection closed while receiving");
                        return self.link.recv().await;
                    }
                }
                event = self.link.poll_event() => self.on_peer_event(event).await?,
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.counterpart.is_some() {
            if let Err(e) = self.send_signal(&Signal::Bye).await {
                trace!(error = %e, "could not say goodbye through broker");
            }
        }
        self.link.close().await;
        self.broker.close().await;
        debug!(peer_id = %self.own_id, "broker transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_deterministic() {
        let a = derive_peer_id(&SecretString::from("a1b2C3d4E5f6"), "ss-");
        let b = derive_peer_id(&SecretString::from("a1b2C3d4E5f6"), "ss-");
        let c = derive_peer_id(&SecretString::from("a1b2C3d4E5f7"), "ss-");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("ss-"));
        assert_eq!(a.len(), 3 + 24);
        assert!(a[3..].chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
