//! Wrapper every transport drives its [`PeerConnection`] through.
//!
//! Adds the bookkeeping the raw capability leaves to the caller:
//! remote candidates that arrive before the remote description are queued
//! and flushed in arrival order right after it is applied, data channel
//! messages seen while waiting on other events are kept for `recv`, and
//! close happens exactly once.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use ss_core::config::BackpressureConfig;
use ss_core::{IceCandidate, SignalKind, SsError, SsResult};

use crate::peer::{ChannelMessage, PeerConnection, PeerEvent};

pub struct PeerLink {
    pc: Box<dyn PeerConnection>,
    remote_applied: bool,
    pending_remote: VecDeque<IceCandidate>,
    local_candidates: Vec<IceCandidate>,
    gathering_complete: bool,
    open: bool,
    closed: bool,
    inbox: VecDeque<ChannelMessage>,
    threshold: usize,
    poll_interval: Duration,
}

impl PeerLink {
    pub fn new(pc: Box<dyn PeerConnection>, backpressure: &BackpressureConfig) -> Self {
        Self {
            pc,
            remote_applied: false,
            pending_remote: VecDeque::new(),
            local_candidates: Vec::new(),
            gathering_complete: false,
            open: false,
            closed: false,
            inbox: VecDeque::new(),
            threshold: backpressure.threshold_bytes,
            poll_interval: Duration::from_millis(backpressure.poll_interval_ms.max(1)),
        }
    }

    pub async fn create_offer(&mut self) -> SsResult<String> {
        self.pc.create_offer().await
    }

    pub async fn create_answer(&mut self) -> SsResult<String> {
        if !self.remote_applied {
            return Err(SsError::transport("cannot answer before the offer is applied"));
        }
        self.pc.create_answer().await
    }

    /// Apply the counterpart's description, then flush queued candidates.
    pub async fn set_remote_description(&mut self, kind: SignalKind, sdp: &str) -> SsResult<()> {
        if self.remote_applied {
            debug!(?kind, "remote description already applied, ignoring duplicate");
            return Ok(());
        }
        self.pc.set_remote_description(kind, sdp).await?;
        self.remote_applied = true;
        let queued = self.pending_remote.len();
        while let Some(candidate) = self.pending_remote.pop_front() {
            self.pc.add_ice_candidate(candidate).await?;
        }
        if queued > 0 {
            debug!(queued, "flushed buffered remote candidates");
        }
        Ok(())
    }

    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> SsResult<()> {
        if self.remote_applied {
            self.pc.add_ice_candidate(candidate).await
        } else {
            trace!("queueing remote candidate until the description arrives");
            self.pending_remote.push_back(candidate);
            Ok(())
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_applied
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    /// Local candidates gathered so far, in gathering order.
    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn is_open(&self) -> bool {
        self.open && !self.closed
    }

    /// Pull one event from the connection and record what it means.
    ///
    /// Messages are queued for [`PeerLink::recv`] as well as returned.
    /// Cancel-safe.
    pub async fn poll_event(&mut self) -> Option<PeerEvent> {
        if self.closed {
            return None;
        }
        let event = self.pc.next_event().await?;
        match &event {
            PeerEvent::LocalCandidate(c) => self.local_candidates.push(c.clone()),
            PeerEvent::GatheringComplete => self.gathering_complete = true,
            PeerEvent::ChannelOpen => {
                debug!("data channel open");
                self.open = true;
            }
            PeerEvent::Message(m) => self.inbox.push_back(m.clone()),
            PeerEvent::Closed => self.open = false,
            PeerEvent::Failed(reason) => {
                warn!(%reason, "peer connection failed");
                self.open = false;
            }
        }
        Some(event)
    }

    /// Collect local candidates until gathering completes or `limit` passes.
    ///
    /// Running out of time is not an error: whatever was gathered is used.
    pub async fn gather(&mut self, limit: Duration) -> Vec<IceCandidate> {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.gathering_complete {
            match tokio::time::timeout_at(deadline, self.poll_event()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        gathered = self.local_candidates.len(),
                        "ICE gathering did not complete in time, using partial candidates"
                    );
                    break;
                }
            }
        }
        self.local_candidates.clone()
    }

    /// Wait for the data channel to open. No timeout of its own.
    pub async fn wait_open(&mut self) -> SsResult<()> {
        while !self.open {
            match self.poll_event().await {
                Some(PeerEvent::Failed(reason)) => return Err(SsError::Transport(reason)),
                Some(PeerEvent::Closed) | None => {
                    return Err(SsError::transport("peer connection closed before the channel opened"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub async fn send(&mut self, message: ChannelMessage) -> SsResult<()> {
        if !self.is_open() {
            return Err(SsError::transport("data channel is not open"));
        }
        self.pc.send(message).await
    }

    /// Send a binary frame once the channel's buffer has drained below the
    /// threshold.
    pub async fn send_with_backpressure(&mut self, data: Bytes) -> SsResult<()> {
        let mut waited = false;
        while self.pc.buffered_amount() > self.threshold {
            if !self.is_open() {
                return Err(SsError::transport("data channel closed while draining"));
            }
            waited = true;
            tokio::time::sleep(self.poll_interval).await;
        }
        if waited {
            trace!(buffered = self.pc.buffered_amount(), "send buffer drained");
        }
        self.send(ChannelMessage::Binary(data)).await
    }

    /// Next data channel message; `None` once the channel is closed.
    pub async fn recv(&mut self) -> SsResult<Option<ChannelMessage>> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            match self.poll_event().await {
                Some(PeerEvent::Failed(reason)) => return Err(SsError::Transport(reason)),
                Some(PeerEvent::Closed) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    /// Take a message already received while waiting on something else.
    pub fn take_buffered(&mut self) -> Option<ChannelMessage> {
        self.inbox.pop_front()
    }

    /// Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open = false;
        self.pc.close().await;
        debug!("peer link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Records calls and replays scripted events.
    struct ScriptedPeer {
        log: Arc<Mutex<Vec<String>>>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        buffered: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerConnection for ScriptedPeer {
        async fn create_offer(&mut self) -> SsResult<String> {
            Ok("offer-sdp".into())
        }
        async fn create_answer(&mut self) -> SsResult<String> {
            Ok("answer-sdp".into())
        }
        async fn set_remote_description(&mut self, kind: SignalKind, _sdp: &str) -> SsResult<()> {
            self.log.lock().unwrap().push(format!("remote:{kind:?}"));
            Ok(())
        }
        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> SsResult<()> {
            self.log.lock().unwrap().push(candidate.candidate);
            Ok(())
        }
        async fn send(&mut self, message: ChannelMessage) -> SsResult<()> {
            self.log.lock().unwrap().push(format!("send:{}", message.len()));
            Ok(())
        }
        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
        async fn next_event(&mut self) -> Option<PeerEvent> {
            self.events.recv().await
        }
        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        link: PeerLink,
        log: Arc<Mutex<Vec<String>>>,
        events: mpsc::UnboundedSender<PeerEvent>,
        buffered: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    fn harness(threshold: usize) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let buffered = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let peer = ScriptedPeer {
            log: log.clone(),
            events: rx,
            buffered: buffered.clone(),
            closes: closes.clone(),
        };
        let cfg = BackpressureConfig {
            threshold_bytes: threshold,
            poll_interval_ms: 1,
        };
        Harness {
            link: PeerLink::new(Box::new(peer), &cfg),
            log,
            events: tx,
            buffered,
            closes,
        }
    }

    #[tokio::test]
    async fn test_early_candidates_flush_in_order() {
        let mut h = harness(1024);
        for c in ["c1", "c2", "c3"] {
            h.link.add_remote_candidate(IceCandidate::new(c)).await.unwrap();
        }
        assert_eq!(h.link.pending_remote_candidates(), 3);
        assert!(h.log.lock().unwrap().is_empty());

        h.link.set_remote_description(SignalKind::Answer, "sdp").await.unwrap();
        h.link.add_remote_candidate(IceCandidate::new("c4")).await.unwrap();

        assert_eq!(
            *h.log.lock().unwrap(),
            vec!["remote:Answer", "c1", "c2", "c3", "c4"]
        );
        assert_eq!(h.link.pending_remote_candidates(), 0);
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let mut h = harness(1024);
        assert!(h.link.create_answer().await.is_err());
        h.link.set_remote_description(SignalKind::Offer, "sdp").await.unwrap();
        assert_eq!(h.link.create_answer().await.unwrap(), "answer-sdp");
    }

    #[tokio::test]
    async fn test_gather_until_complete() {
        let mut h = harness(1024);
        h.events.send(PeerEvent::LocalCandidate(IceCandidate::new("a"))).unwrap();
        h.events.send(PeerEvent::LocalCandidate(IceCandidate::new("b"))).unwrap();
        h.events.send(PeerEvent::GatheringComplete).unwrap();
        let gathered = h.link.gather(Duration::from_secs(5)).await;
        assert_eq!(gathered.len(), 2);
    }

    #[tokio::test]
    async fn test_gather_times_out_with_partial() {
        let mut h = harness(1024);
        h.events.send(PeerEvent::LocalCandidate(IceCandidate::new("a"))).unwrap();
        let gathered = h.link.gather(Duration::from_millis(50)).await;
        assert_eq!(gathered, vec![IceCandidate::new("a")]);
    }

    #[tokio::test]
    async fn test_backpressure_waits_for_drain() {
        let mut h = harness(100);
        h.events.send(PeerEvent::ChannelOpen).unwrap();
        h.link.wait_open().await.unwrap();

        h.buffered.store(500, Ordering::SeqCst);
        let buffered = h.buffered.clone();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            buffered.store(50, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        h.link.send_with_backpressure(Bytes::from_static(b"frame")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
        drain.await.unwrap();
        assert_eq!(h.log.lock().unwrap().last().unwrap(), "send:5");
    }

    #[tokio::test]
    async fn test_messages_seen_while_waiting_are_kept() {
        let mut h = harness(1024);
        h.events.send(PeerEvent::Message(ChannelMessage::Text("early".into()))).unwrap();
        h.events.send(PeerEvent::ChannelOpen).unwrap();
        h.link.wait_open().await.unwrap();
        assert_eq!(
            h.link.recv().await.unwrap(),
            Some(ChannelMessage::Text("early".into()))
        );
    }

    #[tokio::test]
    async fn test_failure_and_idempotent_close() {
        let mut h = harness(1024);
        h.events.send(PeerEvent::Failed("ice failed".into())).unwrap();
        assert!(matches!(h.link.wait_open().await, Err(SsError::Transport(_))));
        assert!(h.link.send(ChannelMessage::Text("x".into())).await.is_err());

        h.link.close().await;
        h.link.close().await;
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert!(h.link.poll_event().await.is_none());
    }
}
