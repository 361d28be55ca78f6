//! In-process relay and broker, used by tests and single-machine demos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use ss_core::{SsError, SsResult};

use crate::broker::BrokerClient;
use crate::relay::RelayClient;

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Topic fan-out shared by every [`MemoryRelay`] cloned from it.
///
/// Like a core NATS subject, nothing is retained: a message published
/// before a client subscribes is never delivered to it.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    topics: Arc<Mutex<Subscribers>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemoryRelay {
        let (tx, rx) = mpsc::unbounded_channel();
        MemoryRelay {
            hub: self.clone(),
            tx,
            rx,
        }
    }

    /// Live subscriptions on `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        lock(&self.topics)
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }
}

pub struct MemoryRelay {
    hub: MemoryRelayHub,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn subscribe(&mut self, topic: &str) -> SsResult<()> {
        lock(&self.hub.topics)
            .entry(topic.to_string())
            .or_default()
            .push(self.tx.clone());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> SsResult<()> {
        let mut topics = lock(&self.hub.topics);
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| !s.is_closed());
            trace!(topic, subscribers = subs.len(), bytes = payload.len(), "memory publish");
            for sub in subs.iter() {
                let _ = sub.send(payload.clone());
            }
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

type Mailboxes = HashMap<String, mpsc::UnboundedSender<(String, Vec<u8>)>>;

/// Peer-id addressed message exchange shared by every [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct MemoryBrokerHub {
    peers: Arc<Mutex<Mailboxes>>,
}

impl MemoryBrokerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemoryBroker {
        MemoryBroker {
            hub: self.clone(),
            id: None,
            rx: None,
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.peers).get(id).is_some_and(|tx| !tx.is_closed())
    }
}

pub struct MemoryBroker {
    hub: MemoryBrokerHub,
    id: Option<String>,
    rx: Option<mpsc::UnboundedReceiver<(String, Vec<u8>)>>,
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn register(&mut self, id: &str) -> SsResult<()> {
        let mut peers = lock(&self.hub.peers);
        if peers.get(id).is_some_and(|tx| !tx.is_closed()) {
            return Err(SsError::Transport(format!("peer id {id} is taken")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(id.to_string(), tx);
        self.id = Some(id.to_string());
        self.rx = Some(rx);
        Ok(())
    }

    async fn send_to(&mut self, peer: &str, payload: Vec<u8>) -> SsResult<()> {
        let from = self
            .id
            .clone()
            .ok_or_else(|| SsError::transport("broker client is not registered"))?;
        let peers = lock(&self.hub.peers);
        let tx = peers
            .get(peer)
            .ok_or_else(|| SsError::Transport(format!("peer {peer} unavailable")))?;
        tx.send((from, payload))
            .map_err(|_| SsError::Transport(format!("peer {peer} unavailable")))
    }

    async fn next_message(&mut self) -> Option<(String, Vec<u8>)> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        if let Some(id) = self.id.take() {
            lock(&self.hub.peers).remove(&id);
        }
        if let Some(rx) = self.rx.as_mut() {
            rx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_fans_out_without_retention() {
        let hub = MemoryRelayHub::new();
        let mut a = hub.client();
        let mut b = hub.client();
        a.subscribe("t").await.unwrap();

        a.publish("t", b"early".to_vec()).await.unwrap();
        b.subscribe("t").await.unwrap();
        a.publish("t", b"late".to_vec()).await.unwrap();

        assert_eq!(a.next_message().await.unwrap(), b"early");
        assert_eq!(a.next_message().await.unwrap(), b"late");
        assert_eq!(b.next_message().await.unwrap(), b"late");
        assert_eq!(hub.subscribers("t"), 2);

        b.close().await;
        a.publish("t", b"x".to_vec()).await.unwrap();
        assert_eq!(hub.subscribers("t"), 1);
    }

    #[tokio::test]
    async fn test_broker_routes_by_id() {
        let hub = MemoryBrokerHub::new();
        let mut host = hub.client();
        let mut joiner = hub.client();
        host.register("ss-host").await.unwrap();
        joiner.register("ss-join").await.unwrap();

        joiner.send_to("ss-host", b"knock".to_vec()).await.unwrap();
        assert_eq!(
            host.next_message().await.unwrap(),
            ("ss-join".to_string(), b"knock".to_vec())
        );

        let mut dup = hub.client();
        assert!(dup.register("ss-host").await.is_err());
        assert!(matches!(
            joiner.send_to("ss-nobody", vec![]).await,
            Err(SsError::Transport(_))
        ));

        host.close().await;
        assert!(!hub.is_registered("ss-host"));
        assert!(dup.register("ss-host").await.is_ok());
    }

    #[tokio::test]
    async fn test_unregistered_broker_cannot_send() {
        let hub = MemoryBrokerHub::new();
        let mut c = hub.client();
        assert!(c.send_to("anyone", vec![]).await.is_err());
        assert!(c.next_message().await.is_none());
    }
}
