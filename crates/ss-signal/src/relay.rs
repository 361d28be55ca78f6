//! Relay-network transport
//!
//! Both sides subscribe to a topic derived from the shared secret. Every
//! signal is sealed with the secret-derived signaling key and signed by a
//! per-transfer ephemeral P-256 key:
//! ```text
//! {"from": b64(SEC1 pubkey), "sealed": b64(nonce ∥ AES-GCM(signal JSON) ∥ tag), "sig": b64(r ∥ s)}
//! ```
//! The first authentic counterpart key is pinned; anything else on the topic
//! is ignored. Relays need not retain messages, so the sender republishes its
//! offer (with the candidates gathered so far) until an answer arrives.
//!
//! If no data channel opens within the channel-open timeout, the sender
//! announces fallback: control text keeps flowing over the relay and binary
//! frames are bundled into one blob per control message boundary:
//! ```text
//! bundle = ([4 bytes: frame length, BE][frame])*
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use p256::ecdsa::{signature::Signer, signature::Verifier, Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use ss_core::config::{BackpressureConfig, SecureSendConfig};
use ss_core::{SignalKind, SignalingPayload, SsError, SsResult, TransportMethod, MAX_PAYLOAD};
use ss_crypto::{decrypt, encrypt, signal_key, DerivedKey, KdfParams};
use ss_storage::BlobStore;

use crate::link::PeerLink;
use crate::peer::{ChannelMessage, PeerConnection, PeerEvent};
use crate::transport::{Capabilities, LinkMode, OfferContext, Signal, SignalingTransport};

/// Publish/subscribe message relay.
#[async_trait]
pub trait RelayClient: Send {
    async fn subscribe(&mut self, topic: &str) -> SsResult<()>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> SsResult<()>;

    /// Next message on a subscribed topic; `None` when the subscription ends.
    /// Must be cancel-safe.
    async fn next_message(&mut self) -> Option<Vec<u8>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub subject_prefix: String,
    /// How long the sender waits for a direct channel before falling back
    pub channel_open_timeout: Duration,
    /// How often the sender repeats its offer while unanswered
    pub republish_interval: Duration,
    /// Skip the direct channel and go straight to blob fallback
    pub force_fallback: bool,
    pub kdf: KdfParams,
    pub backpressure: BackpressureConfig,
}

impl RelayOptions {
    pub fn from_config(cfg: &SecureSendConfig) -> Self {
        Self {
            subject_prefix: cfg.relay.subject_prefix.clone(),
            channel_open_timeout: Duration::from_secs(cfg.relay.channel_open_timeout_secs),
            kdf: KdfParams::from(&cfg.kdf),
            backpressure: cfg.backpressure.clone(),
            ..Self::default()
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            subject_prefix: "securesend.signal".into(),
            channel_open_timeout: Duration::from_secs(15),
            republish_interval: Duration::from_secs(2),
            force_fallback: false,
            kdf: KdfParams::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayEnvelope {
    from: String,
    sealed: String,
    sig: String,
}

/// Topic name both holders of the secret compute independently.
pub fn topic_for(prefix: &str, key: &DerivedKey) -> String {
    let digest = Sha256::new()
        .chain_update(b"securesend-topic-v1")
        .chain_update(key.as_bytes())
        .finalize();
    format!("{prefix}.{}", hex::encode(&digest[..16]))
}

/// Sealed, signed pub/sub channel for one transfer.
struct SealedChannel<R> {
    relay: R,
    topic: String,
    key: DerivedKey,
    identity: SigningKey,
    public: Vec<u8>,
    counterpart: Option<Vec<u8>>,
}

impl<R: RelayClient> SealedChannel<R> {
    async fn publish(&mut self, signal: &Signal) -> SsResult<()> {
        let sealed = encrypt(&self.key, &signal.to_bytes()?)?;
        let sig: Signature = self.identity.sign(&sealed);
        let envelope = RelayEnvelope {
            from: STANDARD.encode(&self.public),
            sealed: STANDARD.encode(&sealed),
            sig: STANDARD.encode(sig.to_bytes()),
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| SsError::malformed(format!("encoding relay envelope: {e}")))?;
        self.relay.publish(&self.topic, bytes).await
    }

    /// Next authentic signal from the counterpart. Cancel-safe.
    async fn next_signal(&mut self) -> SsResult<Signal> {
        loop {
            let data = self
                .relay
                .next_message()
                .await
                .ok_or_else(|| SsError::transport("relay subscription ended"))?;
            if let Some(signal) = self.open(&data) {
                return Ok(signal);
            }
        }
    }

    fn open(&mut self, data: &[u8]) -> Option<Signal> {
        let envelope: RelayEnvelope = match serde_json::from_slice(data) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "ignoring non-envelope relay message");
                return None;
            }
        };
        let from = STANDARD.decode(&envelope.from).ok()?;
        if from == self.public {
            trace!("skipping own relay message");
            return None;
        }
        if self.counterpart.as_ref().is_some_and(|c| c != &from) {
            warn!("ignoring relay message from a third key");
            return None;
        }

        let sealed = STANDARD.decode(&envelope.sealed).ok()?;
        let verified = STANDARD
            .decode(&envelope.sig)
            .ok()
            .and_then(|sig| Signature::from_slice(&sig).ok())
            .zip(VerifyingKey::from_sec1_bytes(&from).ok())
            .is_some_and(|(sig, key)| key.verify(&sealed, &sig).is_ok());
        if !verified {
            warn!("dropping relay message with a bad signature");
            return None;
        }
        let plain = match decrypt(&self.key, &sealed) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping relay message sealed under another key");
                return None;
            }
        };
        let signal = match Signal::from_bytes(&plain) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "dropping malformed signal");
                return None;
            }
        };
        if self.counterpart.is_none() {
            debug!("pinned relay counterpart key");
            self.counterpart = Some(from);
        }
        Some(signal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

pub struct RelayTransport<R: RelayClient> {
    chan: SealedChannel<R>,
    link: PeerLink,
    options: RelayOptions,
    blobs: Option<Arc<dyn BlobStore>>,
    role: Option<Role>,
    offer: Option<SignalingPayload>,
    answered: bool,
    remote_offer: Option<SignalingPayload>,
    mode: Option<LinkMode>,
    fallback_announced: bool,
    direct_failed: bool,
    link_done: bool,
    peer_gone: bool,
    pending_frames: Vec<Bytes>,
    pending_bytes: usize,
    inbox: VecDeque<ChannelMessage>,
    closed: bool,
}

impl<R: RelayClient> RelayTransport<R> {
    /// Derive the signaling key and topic, then subscribe.
    ///
    /// Key derivation runs on the blocking pool.
    pub async fn connect(
        mut relay: R,
        peer: Box<dyn PeerConnection>,
        secret: &SecretString,
        options: RelayOptions,
    ) -> SsResult<Self> {
        let secret = SecretString::from(secret.expose_secret().to_string());
        let params = options.kdf;
        let key = tokio::task::spawn_blocking(move || signal_key(&secret, &params))
            .await
            .map_err(|e| SsError::Other(anyhow::anyhow!("signal key task failed: {e}")))?;

        let topic = topic_for(&options.subject_prefix, &key);
        relay.subscribe(&topic).await?;
        debug!(%topic, "subscribed to relay topic");

        let identity = SigningKey::random(&mut rand::rngs::OsRng);
        let public = identity.verifying_key().to_encoded_point(false).as_bytes().to_vec();

        Ok(Self {
            chan: SealedChannel {
                relay,
                topic,
                key,
                identity,
                public,
                counterpart: None,
            },
            link: PeerLink::new(peer, &options.backpressure),
            options,
            blobs: None,
            role: None,
            offer: None,
            answered: false,
            remote_offer: None,
            mode: None,
            fallback_announced: false,
            direct_failed: false,
            link_done: false,
            peer_gone: false,
            pending_frames: Vec::new(),
            pending_bytes: 0,
            inbox: VecDeque::new(),
            closed: false,
        })
    }

    /// Blob storage for fallback. Both sides need one for fallback to work.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn topic(&self) -> &str {
        &self.chan.topic
    }

    pub fn mode(&self) -> Option<LinkMode> {
        self.mode
    }

    async fn publish_offer(&mut self) -> SsResult<()> {
        let Some(offer) = &self.offer else {
            return Ok(());
        };
        let mut payload = offer.clone();
        payload.candidates = self.link.local_candidates().to_vec();
        self.chan.publish(&Signal::Description { payload }).await
    }

    async fn on_peer_event(&mut self, event: Option<PeerEvent>) -> SsResult<()> {
        match event {
            Some(PeerEvent::LocalCandidate(candidate)) => {
                self.chan.publish(&Signal::Candidate { candidate }).await?;
            }
            Some(PeerEvent::Failed(_)) => {
                self.direct_failed = true;
                self.link_done = true;
            }
            Some(PeerEvent::Closed) | None => self.link_done = true,
            Some(_) => {}
        }
        Ok(())
    }

    async fn enter_fallback(&mut self) -> SsResult<LinkMode> {
        if self.blobs.is_none() {
            return Err(SsError::transport(
                "direct channel unavailable and no blob store configured for fallback",
            ));
        }
        if !self.fallback_announced {
            self.chan.publish(&Signal::Fallback).await?;
            self.fallback_announced = true;
        }
        warn!(topic = %self.chan.topic, "no direct channel; moving data through blob storage");
        self.mode = Some(LinkMode::Fallback);
        Ok(LinkMode::Fallback)
    }

    fn uses_direct(&self) -> bool {
        self.mode == Some(LinkMode::Direct) && self.link.is_open()
    }

    async fn flush_bundle(&mut self) -> SsResult<()> {
        if self.pending_frames.is_empty() {
            return Ok(());
        }
        let blobs = self
            .blobs
            .clone()
            .ok_or_else(|| SsError::transport("no blob store for fallback data"))?;
        let frames = std::mem::take(&mut self.pending_frames);
        self.pending_bytes = 0;
        let count = frames.len() as u32;
        let name = format!("{}.bin", uuid::Uuid::new_v4());
        let locator = blobs.upload(&name, encode_bundle(&frames)).await?;
        info!(%locator, frames = count, "fallback bundle published");
        self.chan
            .publish(&Signal::Bundle {
                locator,
                frames: count,
            })
            .await
    }

    async fn fetch_bundle(&mut self, locator: &str, frames: u32) -> SsResult<()> {
        let blobs = self
            .blobs
            .clone()
            .ok_or_else(|| SsError::transport("counterpart fell back but no blob store is configured"))?;
        let data = blobs.download(locator).await?;
        let decoded = decode_bundle(&data)?;
        if decoded.len() != frames as usize {
            return Err(SsError::malformed(format!(
                "bundle announced {frames} frames but holds {}",
                decoded.len()
            )));
        }
        self.inbox
            .extend(decoded.into_iter().map(ChannelMessage::Binary));
        if let Err(e) = blobs.delete(locator).await {
            warn!(%locator, error = %e, "could not delete consumed fallback bundle");
        }
        Ok(())
    }

    fn queue_frame(&mut self, data: Bytes) -> SsResult<()> {
        let total = (self.pending_bytes + data.len()) as u64;
        if total > MAX_PAYLOAD + MAX_PAYLOAD / 16 {
            return Err(SsError::SizeLimitExceeded {
                size: total,
                limit: MAX_PAYLOAD,
            });
        }
        self.pending_bytes += data.len();
        self.pending_frames.push(data);
        Ok(())
    }
}

#[async_trait]
impl<R: RelayClient> SignalingTransport for RelayTransport<R> {
    fn method(&self) -> TransportMethod {
        TransportMethod::Relay
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            blob_fallback: true,
            trickle_ice: true,
        }
    }

    async fn offer(&mut self, ctx: &OfferContext) -> SsResult<()> {
        self.role = Some(Role::Sender);
        let sdp = self.link.create_offer().await?;
        self.offer = Some(ctx.payload(sdp, Vec::new()));
        self.publish_offer().await?;
        info!(topic = %self.chan.topic, "offer published on relay");
        Ok(())
    }

    async fn await_answer(&mut self) -> SsResult<()> {
        let mut republish = tokio::time::interval(self.options.republish_interval);
        republish.tick().await;
        while !self.answered {
            tokio::select! {
                signal = self.chan.next_signal() => self.handle_signal(signal?).await?,
                event = self.link.poll_event(), if !self.link_done => self.on_peer_event(event).await?,
                _ = republish.tick() => {
                    trace!("republishing unanswered offer");
                    self.publish_offer().await?;
                }
            }
        }
        Ok(())
    }

    async fn await_offer(&mut self) -> SsResult<SignalingPayload> {
        self.role = Some(Role::Receiver);
        loop {
            if let Some(offer) = &self.remote_offer {
                return Ok(offer.clone());
            }
            tokio::select! {
                signal = self.chan.next_signal() => self.handle_signal(signal?).await?,
                event = self.link.poll_event(), if !self.link_done => self.on_peer_event(event).await?,
            }
        }
    }

    async fn answer(&mut self) -> SsResult<()> {
        let sdp = self.link.create_answer().await?;
        let payload = SignalingPayload::answer(sdp, self.link.local_candidates().to_vec());
        self.chan.publish(&Signal::Description { payload }).await?;
        debug!("answer published on relay");
        Ok(())
    }

    async fn handle_signal(&mut self, signal: Signal) -> SsResult<()> {
        match signal {
            Signal::Description { payload } => match (payload.kind, self.role) {
                (SignalKind::Offer, Some(Role::Receiver)) if self.remote_offer.is_none() => {
                    self.link.set_remote_description(SignalKind::Offer, &payload.sdp).await?;
                    for candidate in payload.candidates.iter().cloned() {
                        self.link.add_remote_candidate(candidate).await?;
                    }
                    debug!(candidates = payload.candidates.len(), "offer applied");
                    self.remote_offer = Some(payload);
                }
                (SignalKind::Answer, Some(Role::Sender)) if !self.answered => {
                    self.link.set_remote_description(SignalKind::Answer, &payload.sdp).await?;
                    for candidate in payload.candidates {
                        self.link.add_remote_candidate(candidate).await?;
                    }
                    self.answered = true;
                    debug!("answer applied");
                }
                (kind, _) => trace!(?kind, "ignoring repeated or misdirected description"),
            },
            Signal::Candidate { candidate } => self.link.add_remote_candidate(candidate).await?,
            Signal::Fallback => {
                if self.role == Some(Role::Receiver) {
                    info!("sender switched to blob fallback");
                    self.mode = Some(LinkMode::Fallback);
                }
            }
            Signal::Control { text } => self.inbox.push_back(ChannelMessage::Text(text)),
            Signal::Bundle { locator, frames } => self.fetch_bundle(&locator, frames).await?,
            Signal::Bye => {
                debug!("counterpart left the relay topic");
                self.peer_gone = true;
            }
            Signal::Knock { .. } => trace!("ignoring broker knock on relay"),
        }
        Ok(())
    }

    async fn wait_connected(&mut self) -> SsResult<LinkMode> {
        let is_sender = self.role == Some(Role::Sender);
        if is_sender && self.options.force_fallback {
            return self.enter_fallback().await;
        }
        let deadline = tokio::time::Instant::now() + self.options.channel_open_timeout;
        loop {
            if let Some(mode) = self.mode {
                return Ok(mode);
            }
            if self.link.is_open() {
                info!("direct data channel established");
                self.mode = Some(LinkMode::Direct);
                return Ok(LinkMode::Direct);
            }
            if is_sender && self.direct_failed {
                return self.enter_fallback().await;
            }
            if self.peer_gone {
                return Err(SsError::transport("counterpart left before connecting"));
            }
            tokio::select! {
                signal = self.chan.next_signal() => self.handle_signal(signal?).await?,
                event = self.link.poll_event(), if !self.link_done => self.on_peer_event(event).await?,
                _ = tokio::time::sleep_until(deadline), if is_sender => {
                    return self.enter_fallback().await;
                }
            }
        }
    }

    async fn send(&mut self, message: ChannelMessage) -> SsResult<()> {
        if self.uses_direct() {
            return self.link.send(message).await;
        }
        match message {
            ChannelMessage::Text(text) => {
                self.flush_bundle().await?;
                self.chan.publish(&Signal::Control { text }).await
            }
            ChannelMessage::Binary(data) => self.queue_frame(data),
        }
    }

    async fn send_with_backpressure(&mut self, data: Bytes) -> SsResult<()> {
        if self.uses_direct() {
            self.link.send_with_backpressure(data).await
        } else {
            self.queue_frame(data)
        }
    }

    async fn recv(&mut self) -> SsResult<Option<ChannelMessage>> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            if let Some(message) = self.link.take_buffered() {
                return Ok(Some(message));
            }
            if self.peer_gone {
                return Ok(None);
            }
            if self.link_done && self.mode == Some(LinkMode::Direct) {
                if self.direct_failed {
                    return Err(SsError::transport("data channel failed"));
                }
                return Ok(None);
            }
            tokio::select! {
                signal = self.chan.next_signal() => self.handle_signal(signal?).await?,
                event = self.link.poll_event(), if !self.link_done => self.on_peer_event(event).await?,
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.role.is_some() {
            if let Err(e) = self.chan.publish(&Signal::Bye).await {
                debug!(error = %e, "could not announce departure");
            }
        }
        self.link.close().await;
        self.chan.relay.close().await;
        debug!(topic = %self.chan.topic, "relay transport closed");
    }
}

fn encode_bundle(frames: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames.iter().map(|f| f.len() + 4).sum());
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

fn decode_bundle(mut data: &[u8]) -> SsResult<Vec<Bytes>> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(SsError::malformed("bundle truncated in a length prefix"));
        }
        let (len, rest) = data.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(SsError::malformed("bundle truncated in a frame"));
        }
        let (frame, rest) = rest.split_at(len);
        frames.push(Bytes::copy_from_slice(frame));
        data = rest;
    }
    Ok(frames)
}
