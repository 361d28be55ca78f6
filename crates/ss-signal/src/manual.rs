//! Manual (QR) transport
//!
//! No network signaling at all: each side gathers its candidates, renders
//! its description as one or more QR frames and scans the other side's.
//! Candidates cannot trickle, so gathering runs to completion (or its
//! timeout) before anything is shown.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use ss_core::config::{BackpressureConfig, SecureSendConfig};
use ss_core::{SignalKind, SignalingPayload, SsError, SsResult, TransportMethod};
use ss_qr::{signal_frames, SignalCollector, SignalStatus};

use crate::link::PeerLink;
use crate::peer::{ChannelMessage, PeerConnection, PeerEvent};
use crate::transport::{Capabilities, LinkMode, OfferContext, Signal, SignalingTransport};

#[derive(Debug, Clone)]
pub struct ManualOptions {
    pub frame_capacity: usize,
    pub gather_timeout: Duration,
    pub backpressure: BackpressureConfig,
}

impl ManualOptions {
    pub fn from_config(cfg: &SecureSendConfig) -> Self {
        Self {
            frame_capacity: cfg.qr.frame_capacity,
            gather_timeout: Duration::from_secs(cfg.qr.gather_timeout_secs),
            backpressure: cfg.backpressure.clone(),
        }
    }
}

impl Default for ManualOptions {
    fn default() -> Self {
        Self::from_config(&SecureSendConfig::default())
    }
}

pub struct ManualTransport {
    link: PeerLink,
    /// Frame texts for the UI to render, one batch per description
    display: mpsc::Sender<Vec<String>>,
    /// Raw text of every QR code the camera decodes
    scans: mpsc::Receiver<String>,
    collector: SignalCollector,
    options: ManualOptions,
    expecting: Option<SignalKind>,
    remote_offer: Option<SignalingPayload>,
    answered: bool,
    link_done: bool,
    failure: Option<String>,
}

impl ManualTransport {
    pub fn new(
        peer: Box<dyn PeerConnection>,
        display: mpsc::Sender<Vec<String>>,
        scans: mpsc::Receiver<String>,
        options: ManualOptions,
    ) -> Self {
        Self {
            link: PeerLink::new(peer, &options.backpressure),
            display,
            scans,
            collector: SignalCollector::new(),
            options,
            expecting: None,
            remote_offer: None,
            answered: false,
            link_done: false,
            failure: None,
        }
    }

    async fn show(&mut self, payload: &SignalingPayload) -> SsResult<()> {
        let frames: Vec<String> = signal_frames(payload, self.options.frame_capacity)?
            .iter()
            .map(|f| f.to_text())
            .collect();
        info!(kind = ?payload.kind, frames = frames.len(), "description ready to display");
        self.display
            .send(frames)
            .await
            .map_err(|_| SsError::transport("QR display is gone"))
    }

    /// Feed one scan to the collector; yields a payload once reassembled.
    fn on_scan(&mut self, scan: Option<String>) -> SsResult<Option<SignalingPayload>> {
        let text = scan.ok_or_else(|| SsError::transport("QR scanner closed"))?;
        match self.collector.accept_text(&text) {
            Ok(SignalStatus::Pending { received, total }) => {
                debug!(received, total, "QR frame accepted");
                Ok(None)
            }
            Ok(SignalStatus::Complete(payload)) => Ok(Some(payload)),
            Err(SsError::PayloadChecksumMismatch) => {
                warn!("scanned frames failed their checksum, rescan all frames");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable QR frame");
                Ok(None)
            }
        }
    }

    fn on_peer_event(&mut self, event: Option<PeerEvent>) {
        match event {
            Some(PeerEvent::LocalCandidate(_)) => {
                trace!("late local candidate cannot reach the counterpart")
            }
            Some(PeerEvent::Failed(reason)) => {
                self.failure = Some(reason);
                self.link_done = true;
            }
            Some(PeerEvent::Closed) | None => self.link_done = true,
            Some(_) => {}
        }
    }

    /// Scan until a description of the expected kind has been applied.
    async fn scan_for(&mut self, kind: SignalKind) -> SsResult<()> {
        self.expecting = Some(kind);
        loop {
            let done = match kind {
                SignalKind::Offer => self.remote_offer.is_some(),
                SignalKind::Answer => self.answered,
            };
            if done {
                return Ok(());
            }
            tokio::select! {
                scan = self.scans.recv() => {
                    if let Some(payload) = self.on_scan(scan)? {
                        self.handle_signal(Signal::Description { payload }).await?;
                    }
                }
                event = self.link.poll_event(), if !self.link_done => self.on_peer_event(event),
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for ManualTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Manual
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            blob_fallback: false,
            trickle_ice: false,
        }
    }

    async fn offer(&mut self, ctx: &OfferContext) -> SsResult<()> {
        let sdp = self.link.create_offer().await?;
        let candidates = self.link.gather(self.options.gather_timeout).await;
        let payload = ctx.payload(sdp, candidates);
        self.show(&payload).await
    }

    async fn await_answer(&mut self) -> SsResult<()> {
        self.scan_for(SignalKind::Answer).await
    }

    async fn await_offer(&mut self) -> SsResult<SignalingPayload> {
        self.scan_for(SignalKind::Offer).await?;
        self.remote_offer
            .clone()
            .ok_or_else(|| SsError::transport("offer vanished after scanning"))
    }

    async fn answer(&mut self) -> SsResult<()> {
        let sdp = self.link.create_answer().await?;
        let candidates = self.link.gather(self.options.gather_timeout).await;
        self.show(&SignalingPayload::answer(sdp, candidates)).await
    }

    async fn handle_signal(&mut self, signal: Signal) -> SsResult<()> {
        let Signal::Description { payload } = signal else {
            trace!("only descriptions travel by QR");
            return Ok(());
        };
        if self.expecting != Some(payload.kind) {
            warn!(kind = ?payload.kind, "scanned the wrong kind of QR code, keep scanning");
            return Ok(());
        }
        self.link.set_remote_description(payload.kind, &payload.sdp).await?;
        for candidate in payload.candidates.iter().cloned() {
            self.link.add_remote_candidate(candidate).await?;
        }
        debug!(kind = ?payload.kind, candidates = payload.candidates.len(), "scanned description applied");
        match payload.kind {
            SignalKind::Offer => self.remote_offer = Some(payload),
            SignalKind::Answer => self.answered = true,
        }
        self.expecting = None;
        Ok(())
    }

    async fn wait_connected(&mut self) -> SsResult<LinkMode> {
        loop {
            if let Some(reason) = &self.failure {
                return Err(SsError::Transport(format!("peer connection failed: {reason}")));
            }
            if self.link.is_open() {
                info!("direct data channel established");
                return Ok(LinkMode::Direct);
            }
            if self.link_done {
                return Err(SsError::transport("peer connection closed before the channel opened"));
            }
            let event = self.link.poll_event().await;
            self.on_peer_event(event);
        }
    }

    async fn send(&mut self, message: ChannelMessage) -> SsResult<()> {
        self.link.send(message).await
    }

    async fn send_with_backpressure(&mut self, data: Bytes) -> SsResult<()> {
        self.link.send_with_backpressure(data).await
    }

    async fn recv(&mut self) -> SsResult<Option<ChannelMessage>> {
        if let Some(message) = self.link.take_buffered() {
            return Ok(Some(message));
        }
        if self.link_done {
            return Ok(None);
        }
        self.link.recv().await
    }

    async fn close(&mut self) {
        self.link.close().await;
        self.scans.close();
    }
}
