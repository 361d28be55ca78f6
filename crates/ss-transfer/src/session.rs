//! One transfer, either direction, over any [`SignalingTransport`].
//!
//! Every suspension point races the session's cancellation token and the
//! current stage's deadline. Whatever the exit path, the transport is closed
//! exactly once and the state settles: `Complete` on success, `Idle` on
//! cancellation, `Error(message)` otherwise.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use zeroize::Zeroizing;

use ss_core::config::SecureSendConfig;
use ss_core::{
    now_millis, ContentType, SsError, SsResult, Stage, TransferMetadata, TransportMethod, MAX_PAYLOAD,
    SALT_SIZE,
};
use ss_crypto::{
    chunk_count, derive_key_with, generate_salt, ChunkSealer, DerivedKey, KdfParams, Pin, CHUNK_FRAME_OVERHEAD,
};
use ss_passkey::PairingKey;
use ss_signal::{ChannelMessage, OfferContext, SignalingTransport};

use crate::assembly::Assembly;
use crate::message::ControlMessage;
use crate::state::TransferState;

/// How long a best-effort cancel/abort notice may take before teardown.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub metadata_timeout: Duration,
    pub transfer_timeout: Duration,
    /// Metadata older than this is refused. Also bounds how long a sender
    /// waits for its counterpart to answer.
    pub pin_ttl: Duration,
    pub chunk_size: usize,
    pub kdf: KdfParams,
}

impl SessionConfig {
    pub fn from_config(cfg: &SecureSendConfig) -> Self {
        Self {
            connect_timeout: cfg.transfer.connect_timeout(),
            metadata_timeout: cfg.transfer.metadata_timeout(),
            transfer_timeout: cfg.transfer.transfer_timeout(),
            pin_ttl: cfg.transfer.pin_ttl(),
            chunk_size: cfg.transfer.chunk_size.max(1),
            kdf: KdfParams::from(&cfg.kdf),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&SecureSendConfig::default())
    }
}

/// What the transfer key is derived from.
#[derive(Debug)]
pub enum TransferSecret {
    Pin(Pin),
    /// A completed passkey pairing replaces the PIN
    PairingKey(PairingKey),
    /// Any other pre-shared passphrase
    Shared(SecretString),
}

impl TransferSecret {
    /// The transport a PIN selects; other secrets leave the choice to the caller.
    pub fn method(&self) -> Option<TransportMethod> {
        match self {
            TransferSecret::Pin(pin) => Some(pin.method()),
            _ => None,
        }
    }

    /// When the secret stops being usable, if it ever does.
    pub fn expires_at(&self) -> Option<u64> {
        match self {
            TransferSecret::Pin(pin) => pin.expires_at(),
            _ => None,
        }
    }

    /// Secret text for the KDF and for transport rendezvous.
    pub fn resolve(&self, now_ms: u64) -> SsResult<SecretString> {
        match self {
            TransferSecret::Pin(pin) if pin.is_expired(now_ms) => Err(SsError::Expired),
            TransferSecret::Pin(pin) => Ok(SecretString::from(pin.expose().to_string())),
            TransferSecret::PairingKey(key) if !key.is_complete() => Err(SsError::SignatureInvalid(
                "pairing key is missing a participant signature".into(),
            )),
            TransferSecret::PairingKey(key) => Ok(key.transfer_secret()),
            TransferSecret::Shared(secret) => Ok(SecretString::from(secret.expose_secret().to_string())),
        }
    }
}

/// What the sender hands over.
pub enum Outgoing {
    Text(String),
    File {
        name: String,
        mime_type: Option<String>,
        data: Vec<u8>,
    },
}

/// A verified, fully assembled transfer.
pub struct Received {
    pub metadata: TransferMetadata,
    pub data: Zeroizing<Vec<u8>>,
}

impl Received {
    pub fn text(&self) -> SsResult<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| SsError::malformed(format!("received text is not UTF-8: {e}")))
    }
}

impl std::fmt::Debug for Received {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Received")
            .field("metadata", &self.metadata)
            .field("data", &format_args!("[{} bytes]", self.data.len()))
            .finish()
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Session {
    config: SessionConfig,
    state: watch::Sender<TransferState>,
    cancel: CancellationToken,
    busy: AtomicBool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(TransferState::Idle);
        Self {
            config,
            state,
            cancel: CancellationToken::new(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    /// Observe every state change.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// Stop the running transfer. Permanent: later calls fail with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle other tasks can cancel through.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Encrypt `payload` and stream it to the counterpart, returning once the
    /// receiver has acknowledged every chunk.
    pub async fn send<T: SignalingTransport>(
        &self,
        transport: &mut T,
        secret: &TransferSecret,
        payload: Outgoing,
    ) -> SsResult<()> {
        let _busy = self.acquire()?;
        let span = info_span!("send", transfer = %uuid::Uuid::new_v4(), method = %transport.method());
        async {
            let mut connected = false;
            let result = self.run_send(transport, secret, payload, &mut connected).await;
            self.finish(transport, connected, &result).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Negotiate with a sender, then receive, verify and assemble its payload.
    pub async fn receive<T: SignalingTransport>(
        &self,
        transport: &mut T,
        secret: &TransferSecret,
    ) -> SsResult<Received> {
        let _busy = self.acquire()?;
        let span = info_span!("receive", transfer = %uuid::Uuid::new_v4(), method = %transport.method());
        async {
            let mut connected = false;
            let result = self.run_receive(transport, secret, &mut connected).await;
            self.finish(transport, connected, &result).await;
            result
        }
        .instrument(span)
        .await
    }

    fn acquire(&self) -> SsResult<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SsError::Busy);
        }
        Ok(BusyGuard(&self.busy))
    }

    fn check_cancelled(&self) -> SsResult<()> {
        if self.cancel.is_cancelled() {
            Err(SsError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, next: TransferState) {
        if self.cancel.is_cancelled() && next != TransferState::Idle {
            return;
        }
        let current = self.state.borrow().clone();
        if !current.allows(&next) {
            warn!(from = %current, to = %next, "ignoring illegal state transition");
            return;
        }
        if current.name() == next.name() {
            trace!(state = %next, "progress");
        } else {
            info!(from = current.name(), to = %next, "state changed");
        }
        self.state.send_replace(next);
    }

    /// Run `work` until it finishes, the deadline passes or the session is
    /// cancelled.
    async fn guarded<F, R>(&self, stage: Stage, deadline: Instant, work: F) -> SsResult<R>
    where
        F: Future<Output = SsResult<R>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SsError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, work) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(%stage, "stage timed out");
                    Err(SsError::TransportTimeout { stage })
                }
            },
        }
    }

    /// `pin_ttl` from now, or sooner if the secret itself expires first.
    fn counterpart_deadline(&self, secret: &TransferSecret) -> Instant {
        let now = Instant::now();
        let ttl = match secret.expires_at() {
            Some(at) => self
                .config
                .pin_ttl
                .min(Duration::from_millis(at.saturating_sub(now_millis()))),
            None => self.config.pin_ttl,
        };
        now + ttl
    }

    /// PBKDF2 on the blocking pool; cancellation abandons the wait.
    async fn derive(&self, secret: SecretString, salt: [u8; SALT_SIZE]) -> SsResult<DerivedKey> {
        let params = self.config.kdf;
        let task = tokio::task::spawn_blocking(move || derive_key_with(&secret, &salt, &params));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SsError::Cancelled),
            joined = task => joined
                .map_err(|e| SsError::Other(anyhow::anyhow!("key derivation task failed: {e}"))),
        }
    }

    async fn run_send<T: SignalingTransport>(
        &self,
        transport: &mut T,
        secret: &TransferSecret,
        payload: Outgoing,
        connected: &mut bool,
    ) -> SsResult<()> {
        self.check_cancelled()?;
        let shared = secret.resolve(now_millis())?;

        let (content_type, file_name, mime_type, plaintext) = match payload {
            Outgoing::Text(text) => (ContentType::Text, None, None, Zeroizing::new(text.into_bytes())),
            Outgoing::File { name, mime_type, data } => {
                (ContentType::File, Some(name), mime_type, Zeroizing::new(data))
            }
        };
        let total_bytes = plaintext.len() as u64;
        if total_bytes > MAX_PAYLOAD {
            return Err(SsError::SizeLimitExceeded {
                size: total_bytes,
                limit: MAX_PAYLOAD,
            });
        }
        let chunk_size = self.config.chunk_size.max(1);
        let salt = generate_salt();
        let metadata = TransferMetadata {
            content_type,
            total_bytes,
            chunk_count: chunk_count(total_bytes, chunk_size),
            file_name,
            file_size: (content_type == ContentType::File).then_some(total_bytes),
            mime_type,
            created_at: now_millis(),
            salt,
        };
        let total = metadata.chunk_count;

        self.set_state(TransferState::Connecting);
        let key = self.derive(shared, salt).await?;
        let ctx = OfferContext {
            salt,
            preview: Some(metadata.clone()),
        };
        // The counterpart may take as long as the PIN lives to show up.
        let answered = self
            .guarded(Stage::Connect, self.counterpart_deadline(secret), async {
                transport.offer(&ctx).await?;
                self.set_state(TransferState::WaitingForCounterpart);
                transport.await_answer().await
            })
            .await;
        match answered {
            Err(SsError::TransportTimeout { .. }) => {
                warn!("no counterpart answered before the PIN expired");
                return Err(SsError::Expired);
            }
            other => other?,
        }
        let connect_deadline = Instant::now() + self.config.connect_timeout;
        let mode = self
            .guarded(Stage::Connect, connect_deadline, transport.wait_connected())
            .await?;
        *connected = true;
        info!(?mode, chunks = total, bytes = total_bytes, "connected, sending");

        self.set_state(TransferState::Transferring { sent: 0, total });
        let deadline = Instant::now() + self.config.transfer_timeout;
        let sealer = ChunkSealer::new(&key);
        self.guarded(Stage::Transfer, deadline, async {
            send_control(transport, &ControlMessage::Metadata { metadata }).await?;
            for (index, chunk) in plaintext.chunks(chunk_size).enumerate() {
                self.check_cancelled()?;
                let index = index as u32;
                let frame = sealer.encrypt_chunk(index, chunk)?.to_frame();
                transport.send_with_backpressure(Bytes::from(frame)).await?;
                self.set_state(TransferState::Transferring {
                    sent: index + 1,
                    total,
                });
            }
            send_control(transport, &ControlMessage::Done).await
        })
        .await?;

        self.guarded(Stage::Acknowledgment, deadline, async {
            loop {
                let message = transport
                    .recv()
                    .await?
                    .ok_or_else(|| SsError::transport("receiver left before acknowledging"))?;
                self.check_cancelled()?;
                let ChannelMessage::Text(text) = message else {
                    trace!("ignoring binary frame while awaiting acknowledgment");
                    continue;
                };
                match ControlMessage::from_text(&text)? {
                    ControlMessage::DoneAck => return Ok(()),
                    ControlMessage::Cancel => return Err(SsError::transport("receiver cancelled")),
                    ControlMessage::Abort { reason } => {
                        return Err(SsError::Transport(format!("receiver aborted: {reason}")))
                    }
                    other => debug!(?other, "ignoring control message while awaiting acknowledgment"),
                }
            }
        })
        .await?;

        self.set_state(TransferState::Complete);
        info!(bytes = total_bytes, "transfer acknowledged by receiver");
        Ok(())
    }

    async fn run_receive<T: SignalingTransport>(
        &self,
        transport: &mut T,
        secret: &TransferSecret,
        connected: &mut bool,
    ) -> SsResult<Received> {
        self.check_cancelled()?;
        let shared = secret.resolve(now_millis())?;

        self.set_state(TransferState::Connecting);
        let connect_deadline = Instant::now() + self.config.connect_timeout;
        let (offer, salt, key) = self
            .guarded(Stage::Connect, connect_deadline, async {
                self.set_state(TransferState::WaitingForOffer);
                let offer = transport.await_offer().await?;
                let salt = offer
                    .salt
                    .ok_or_else(|| SsError::malformed("offer carries no salt"))?;
                if let Some(size) = offer.total_bytes.filter(|size| *size > MAX_PAYLOAD) {
                    return Err(SsError::SizeLimitExceeded {
                        size,
                        limit: MAX_PAYLOAD,
                    });
                }
                self.set_state(TransferState::GeneratingAnswer);
                let key = self.derive(shared, salt).await?;
                transport.answer().await?;
                self.set_state(TransferState::ShowingAnswer);
                let mode = transport.wait_connected().await?;
                info!(?mode, "connected, waiting for metadata");
                Ok((offer, salt, key))
            })
            .await?;
        *connected = true;

        // Chunks that overtake the metadata are held, up to what the offer
        // previewed.
        let early_budget = offer.total_bytes.unwrap_or(MAX_PAYLOAD).max(1);
        let mut early_bytes = 0u64;
        let mut early = Vec::new();
        let metadata_deadline = Instant::now() + self.config.metadata_timeout;
        let metadata = self
            .guarded(Stage::Metadata, metadata_deadline, async {
                loop {
                    let message = transport
                        .recv()
                        .await?
                        .ok_or_else(|| SsError::transport("sender left before sending metadata"))?;
                    self.check_cancelled()?;
                    match message {
                        ChannelMessage::Binary(frame) => {
                            if frame.len() < CHUNK_FRAME_OVERHEAD {
                                return Err(SsError::malformed("chunk frame too short"));
                            }
                            early_bytes += (frame.len() - CHUNK_FRAME_OVERHEAD).max(1) as u64;
                            if early_bytes > early_budget {
                                return Err(SsError::SizeLimitExceeded {
                                    size: early_bytes,
                                    limit: early_budget,
                                });
                            }
                            early.push(frame);
                        }
                        ChannelMessage::Text(text) => match ControlMessage::from_text(&text)? {
                            ControlMessage::Metadata { metadata } => return Ok(metadata),
                            other => peer_ended(other)?,
                        },
                    }
                }
            })
            .await?;

        metadata.validate(&salt, self.config.pin_ttl, now_millis())?;
        if offer
            .total_bytes
            .is_some_and(|previewed| previewed != metadata.total_bytes)
        {
            return Err(SsError::malformed("metadata disagrees with the offer preview"));
        }
        let total = metadata.chunk_count;
        info!(chunks = total, bytes = metadata.total_bytes, content = ?metadata.content_type, "metadata accepted");

        self.set_state(TransferState::Receiving { received: 0, total });
        let mut assembly = Assembly::new(&metadata);
        for frame in early {
            assembly.accept(&key, &frame)?;
        }
        let deadline = Instant::now() + self.config.transfer_timeout;
        self.guarded(Stage::Transfer, deadline, async {
            loop {
                let message = transport
                    .recv()
                    .await?
                    .ok_or_else(|| SsError::transport("sender left mid-transfer"))?;
                self.check_cancelled()?;
                match message {
                    ChannelMessage::Binary(frame) => {
                        if assembly.accept(&key, &frame)? {
                            self.set_state(TransferState::Receiving {
                                received: assembly.received(),
                                total,
                            });
                        }
                    }
                    ChannelMessage::Text(text) => match ControlMessage::from_text(&text)? {
                        ControlMessage::Done => return Ok(()),
                        other => peer_ended(other)?,
                    },
                }
            }
        })
        .await?;

        let data = assembly.finish()?;
        self.guarded(
            Stage::Acknowledgment,
            deadline,
            send_control(transport, &ControlMessage::DoneAck),
        )
        .await?;

        self.set_state(TransferState::Complete);
        info!(bytes = data.len(), "transfer verified and acknowledged");
        Ok(Received { metadata, data })
    }

    /// Tell a connected counterpart why we are stopping, close the transport
    /// and settle the state.
    async fn finish<T: SignalingTransport, R>(&self, transport: &mut T, connected: bool, result: &SsResult<R>) {
        if let Err(e) = result {
            if connected {
                let notice = match e {
                    SsError::Cancelled => ControlMessage::Cancel,
                    other => ControlMessage::Abort {
                        reason: other.to_string(),
                    },
                };
                if tokio::time::timeout(NOTICE_TIMEOUT, send_control(transport, &notice))
                    .await
                    .map_or(true, |sent| sent.is_err())
                {
                    debug!("counterpart not notified of failure");
                }
            }
        }
        transport.close().await;
        match result {
            Ok(_) => {}
            Err(SsError::Cancelled) => {
                info!("transfer cancelled");
                self.set_state(TransferState::Idle);
            }
            Err(e) => {
                warn!(error = %e, "transfer failed");
                self.set_state(TransferState::Error(e.to_string()));
            }
        }
    }
}

async fn send_control<T: SignalingTransport>(transport: &mut T, message: &ControlMessage) -> SsResult<()> {
    transport.send(ChannelMessage::Text(message.to_text()?)).await
}

/// Map a control message that is out of place for the current stage.
fn peer_ended(message: ControlMessage) -> SsResult<()> {
    match message {
        ControlMessage::Cancel => Err(SsError::transport("sender cancelled")),
        ControlMessage::Abort { reason } => Err(SsError::Transport(format!("sender aborted: {reason}"))),
        other => {
            debug!(?other, "ignoring unexpected control message");
            Ok(())
        }
    }
}
