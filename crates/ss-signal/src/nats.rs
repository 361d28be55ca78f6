//! NATS as the signaling relay.
//!
//! Plain core publish/subscribe: nothing is retained, which the relay
//! transport already tolerates by republishing its offer.
//!
//! Requires feature `nats` (async-nats optional dep).

#[cfg(feature = "nats")]
pub use inner::*;

#[cfg(feature = "nats")]
mod inner {
    use async_trait::async_trait;
    use futures::StreamExt;
    use tracing::{debug, info, warn};

    use ss_core::{SsError, SsResult};

    use crate::relay::RelayClient;

    pub struct NatsRelay {
        client: async_nats::Client,
        subscriber: Option<async_nats::Subscriber>,
    }

    impl NatsRelay {
        pub async fn connect(url: &str) -> SsResult<Self> {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| SsError::Transport(format!("connecting to NATS at {url}: {e}")))?;
            info!("NATS: connected to {url}");
            Ok(Self {
                client,
                subscriber: None,
            })
        }
    }

    #[async_trait]
    impl RelayClient for NatsRelay {
        async fn subscribe(&mut self, topic: &str) -> SsResult<()> {
            let sub = self
                .client
                .subscribe(topic.to_string())
                .await
                .map_err(|e| SsError::Transport(format!("subscribing to {topic}: {e}")))?;
            debug!(%topic, "NATS: subscribed");
            self.subscriber = Some(sub);
            Ok(())
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> SsResult<()> {
            self.client
                .publish(topic.to_string(), payload.into())
                .await
                .map_err(|e| SsError::Transport(format!("publishing to {topic}: {e}")))
        }

        async fn next_message(&mut self) -> Option<Vec<u8>> {
            let sub = self.subscriber.as_mut()?;
            sub.next().await.map(|msg| msg.payload.to_vec())
        }

        async fn close(&mut self) {
            if let Some(mut sub) = self.subscriber.take() {
                if let Err(e) = sub.unsubscribe().await {
                    warn!("NATS: unsubscribe failed: {e}");
                }
            }
            if let Err(e) = self.client.flush().await {
                debug!("NATS: flush on close failed: {e}");
            }
        }
    }
}
