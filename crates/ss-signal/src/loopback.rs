//! In-process [`PeerConnection`] for tests and local tooling.
//!
//! Peers created from one [`LoopbackNetwork`] connect once each side has a
//! local description, the other's description and at least one of its
//! candidates, mirroring the order real ICE needs. A blocked network never
//! opens a channel, which is how relay fallback is exercised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use ss_core::{IceCandidate, SignalKind, SsError, SsResult};

use crate::peer::{ChannelMessage, PeerConnection, PeerEvent};

#[derive(Default)]
struct Endpoint {
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
    /// Remote endpoint id once this side is ready to connect
    ready_for: Option<u64>,
    connected_to: Option<u64>,
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    blocked: bool,
}

impl NetState {
    fn emit(&self, id: u64, event: PeerEvent) {
        if let Some(tx) = self.endpoints.get(&id).and_then(|e| e.events.as_ref()) {
            let _ = tx.send(event);
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network on which no data channel ever opens.
    pub fn blocked() -> Self {
        let net = Self::default();
        net.lock().blocked = true;
        net
    }

    pub fn peer(&self) -> LoopbackPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.endpoints.insert(
                id,
                Endpoint {
                    events: Some(tx),
                    ..Default::default()
                },
            );
            id
        };
        LoopbackPeer {
            id,
            net: self.clone(),
            events: rx,
            local: None,
            remote: None,
            remote_candidate: false,
        }
    }

    /// Number of peers that have not been closed.
    pub fn live_peers(&self) -> usize {
        self.lock()
            .endpoints
            .values()
            .filter(|e| e.events.is_some())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct LoopbackPeer {
    id: u64,
    net: LoopbackNetwork,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    local: Option<SignalKind>,
    remote: Option<u64>,
    remote_candidate: bool,
}

impl LoopbackPeer {
    fn sdp(&self, kind: SignalKind) -> String {
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=loopback-{:?}\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
            self.id, kind
        )
    }

    fn parse_id(sdp: &str) -> SsResult<u64> {
        sdp.lines()
            .find_map(|l| l.strip_prefix("o=- "))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| SsError::malformed("not a loopback session description"))
    }

    /// Emit this peer's single host candidate, then finish gathering.
    fn gather(&self) {
        let state = self.net.lock();
        let candidate = IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.id,
            40000 + self.id
        ));
        state.emit(self.id, PeerEvent::LocalCandidate(candidate));
        state.emit(self.id, PeerEvent::GatheringComplete);
    }

    fn try_connect(&self) {
        let (Some(_), Some(remote), true) = (self.local, self.remote, self.remote_candidate) else {
            return;
        };
        let mut state = self.net.lock();
        if state.blocked {
            return;
        }
        if let Some(me) = state.endpoints.get_mut(&self.id) {
            me.ready_for = Some(remote);
        }
        let counterpart_ready = state
            .endpoints
            .get(&remote)
            .is_some_and(|e| e.ready_for == Some(self.id) && e.events.is_some());
        if counterpart_ready {
            for (a, b) in [(self.id, remote), (remote, self.id)] {
                if let Some(e) = state.endpoints.get_mut(&a) {
                    e.connected_to = Some(b);
                }
            }
            state.emit(self.id, PeerEvent::ChannelOpen);
            state.emit(remote, PeerEvent::ChannelOpen);
            debug!(a = self.id, b = remote, "loopback channel open");
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&mut self) -> SsResult<String> {
        self.local = Some(SignalKind::Offer);
        self.gather();
        self.try_connect();
        Ok(self.sdp(SignalKind::Offer))
    }

    async fn create_answer(&mut self) -> SsResult<String> {
        if self.remote.is_none() {
            return Err(SsError::transport("no remote offer applied"));
        }
        self.local = Some(SignalKind::Answer);
        self.gather();
        self.try_connect();
        Ok(self.sdp(SignalKind::Answer))
    }

    async fn set_remote_description(&mut self, _kind: SignalKind, sdp: &str) -> SsResult<()> {
        self.remote = Some(Self::parse_id(sdp)?);
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> SsResult<()> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(SsError::malformed("bad ICE candidate line"));
        }
        self.remote_candidate = true;
        self.try_connect();
        Ok(())
    }

    async fn send(&mut self, message: ChannelMessage) -> SsResult<()> {
        let state = self.net.lock();
        let peer = state
            .endpoints
            .get(&self.id)
            .and_then(|e| e.connected_to)
            .ok_or_else(|| SsError::transport("loopback channel not connected"))?;
        state.emit(peer, PeerEvent::Message(message));
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        let mut state = self.net.lock();
        let peer = state.endpoints.get_mut(&self.id).and_then(|e| {
            e.events = None;
            e.connected_to.take()
        });
        if let Some(peer) = peer {
            state.emit(peer, PeerEvent::Closed);
            if let Some(e) = state.endpoints.get_mut(&peer) {
                e.connected_to = None;
            }
        }
        self.events.close();
    }
}
