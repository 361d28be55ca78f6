//! Full send/receive sessions over in-process transports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use opendal::Operator;
use secrecy::SecretString;
use tokio::sync::mpsc;

use ss_core::{now_millis, ContentType, SsError, SsResult, Stage, TransferMetadata, TransportMethod};
use ss_crypto::{
    chunk_count, decrypt, derive_key_with, encrypt, generate_pin, generate_salt, ChunkSealer, KdfParams,
};
use ss_passkey::{Authenticator, Identity, PairingKey, PairingSession, SoftAuthenticator};
use ss_signal::{
    BrokerOptions, BrokerTransport, ChannelMessage, LoopbackNetwork, ManualOptions, ManualTransport,
    MemoryBrokerHub, MemoryRelay, MemoryRelayHub, OfferContext, RelayOptions, RelayTransport,
    SignalingTransport,
};
use ss_storage::OperatorBlobStore;
use ss_transfer::{ControlMessage, Outgoing, Session, SessionConfig, TransferSecret, TransferState};

const PIN: &str = "A1b2C3d4E5f6";
const FAST_KDF: KdfParams = KdfParams { iterations: 1000 };
const LIMIT: Duration = Duration::from_secs(30);

fn config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(10),
        metadata_timeout: Duration::from_secs(5),
        transfer_timeout: Duration::from_secs(10),
        pin_ttl: Duration::from_secs(600),
        chunk_size: 1024,
        kdf: FAST_KDF,
    }
}

fn shared(text: &str) -> TransferSecret {
    TransferSecret::Shared(SecretString::from(text))
}

fn relay_options() -> RelayOptions {
    RelayOptions {
        kdf: FAST_KDF,
        channel_open_timeout: Duration::from_millis(300),
        republish_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

async fn relay_pair(
    hub: &MemoryRelayHub,
    net: &LoopbackNetwork,
    secret: &str,
) -> (
    RelayTransport<MemoryRelay>,
    RelayTransport<MemoryRelay>,
) {
    let secret = SecretString::from(secret);
    let a = RelayTransport::connect(hub.client(), Box::new(net.peer()), &secret, relay_options())
        .await
        .unwrap();
    let b = RelayTransport::connect(hub.client(), Box::new(net.peer()), &secret, relay_options())
        .await
        .unwrap();
    (a, b)
}

fn manual_pair(net: &LoopbackNetwork) -> (ManualTransport, ManualTransport) {
    let (show_a, mut shown_a) = mpsc::channel::<Vec<String>>(4);
    let (scan_a_tx, scan_a) = mpsc::channel(64);
    let (show_b, mut shown_b) = mpsc::channel::<Vec<String>>(4);
    let (scan_b_tx, scan_b) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(frames) = shown_a.recv().await {
            for frame in frames {
                let _ = scan_b_tx.send(frame).await;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(frames) = shown_b.recv().await {
            for frame in frames {
                let _ = scan_a_tx.send(frame).await;
            }
        }
    });
    (
        ManualTransport::new(Box::new(net.peer()), show_a, scan_a, ManualOptions::default()),
        ManualTransport::new(Box::new(net.peer()), show_b, scan_b, ManualOptions::default()),
    )
}

#[tokio::test]
async fn hello_over_relay() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::new();
    let (mut tx, mut rx) = relay_pair(&hub, &net, PIN).await;
    let sender = Session::new(config());
    let receiver = Session::new(config());
    let mut states = receiver.subscribe();

    let (s_tx, s_rx) = (shared(PIN), shared(PIN));

    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(&mut tx, &s_tx, Outgoing::Text("hello".into())),
            receiver.receive(&mut rx, &s_rx),
        )
    })
    .await
    .unwrap();

    sent.unwrap();
    let received = received.unwrap();
    assert_eq!(received.text().unwrap(), "hello");
    assert_eq!(received.metadata.total_bytes, 5);
    assert_eq!(received.metadata.content_type, ContentType::Text);
    assert_eq!(sender.state(), TransferState::Complete);
    assert_eq!(receiver.state(), TransferState::Complete);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), TransferState::Complete);
    assert_eq!(net.live_peers(), 0);
}

#[tokio::test]
async fn file_through_relay_fallback() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::blocked();
    let op = Operator::new(opendal::services::Memory::default())
        .unwrap()
        .finish();
    let blobs = Arc::new(OperatorBlobStore::new(op, "fallback"));
    let (tx, rx) = relay_pair(&hub, &net, PIN).await;
    let mut tx = tx.with_blob_store(blobs.clone());
    let mut rx = rx.with_blob_store(blobs);

    let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 251) as u8).collect();
    let sender = Session::new(config());
    let receiver = Session::new(config());
    let (s_tx, s_rx) = (shared(PIN), shared(PIN));
    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(
                &mut tx,
                &s_tx,
                Outgoing::File {
                    name: "notes.bin".into(),
                    mime_type: Some("application/octet-stream".into()),
                    data: data.clone(),
                },
            ),
            receiver.receive(&mut rx, &s_rx),
        )
    })
    .await
    .unwrap();

    sent.unwrap();
    let received = received.unwrap();
    assert_eq!(&received.data[..], &data[..]);
    assert_eq!(received.metadata.chunk_count, 5);
    assert_eq!(received.metadata.file_name.as_deref(), Some("notes.bin"));
    assert_eq!(received.metadata.file_size, Some(5000));
}

#[tokio::test]
async fn file_over_broker() {
    let hub = MemoryBrokerHub::new();
    let net = LoopbackNetwork::new();
    let pin = generate_pin(TransportMethod::CloudBroker);
    let secret = SecretString::from(pin.expose().to_string());
    let options = BrokerOptions {
        knock_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let mut host = BrokerTransport::host(hub.client(), Box::new(net.peer()), &secret, options.clone())
        .await
        .unwrap();
    let mut joiner = BrokerTransport::join(hub.client(), Box::new(net.peer()), &secret, options)
        .await
        .unwrap();

    let data = vec![0x5Au8; 3000];
    let sender = Session::new(config());
    let receiver = Session::new(config());
    let sender_secret = TransferSecret::Pin(pin.clone());
    let receiver_secret = TransferSecret::Pin(pin);
    assert_eq!(sender_secret.method(), Some(TransportMethod::CloudBroker));
    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(
                &mut host,
                &sender_secret,
                Outgoing::File {
                    name: "a.dat".into(),
                    mime_type: None,
                    data: data.clone(),
                },
            ),
            receiver.receive(&mut joiner, &receiver_secret),
        )
    })
    .await
    .unwrap();
    sent.unwrap();
    assert_eq!(&received.unwrap().data[..], &data[..]);
}

#[tokio::test]
async fn wrong_pin_fails_authentication() {
    let net = LoopbackNetwork::new();
    let (mut tx, mut rx) = manual_pair(&net);
    let sender = Session::new(config());
    let receiver = Session::new(config());
    let (s_tx, s_rx) = (shared(PIN), shared("A1b2C3d4E5f7"));

    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(&mut tx, &s_tx, Outgoing::Text("hello".into())),
            receiver.receive(&mut rx, &s_rx),
        )
    })
    .await
    .unwrap();

    assert!(matches!(received, Err(SsError::AuthenticationFailed)));
    assert!(sent.is_err());
    assert!(matches!(receiver.state(), TransferState::Error(_)));
    assert!(matches!(sender.state(), TransferState::Error(_)));
}

#[tokio::test]
async fn hello_scenario_keys() {
    let salt = [0x42u8; 16];
    let key = derive_key_with(&SecretString::from(PIN), &salt, &FAST_KDF);
    let blob = encrypt(&key, b"hello").unwrap();
    assert_eq!(decrypt(&key, &blob).unwrap(), b"hello");

    let wrong_salt = derive_key_with(&SecretString::from(PIN), &[0x43u8; 16], &FAST_KDF);
    assert!(matches!(decrypt(&wrong_salt, &blob), Err(SsError::AuthenticationFailed)));
    let wrong_pin = derive_key_with(&SecretString::from("A1b2C3d4E5f7"), &salt, &FAST_KDF);
    assert!(matches!(decrypt(&wrong_pin, &blob), Err(SsError::AuthenticationFailed)));
}

async fn identity() -> Identity {
    let auth = SoftAuthenticator::generate("securesend.test");
    let master = auth.master_key(b"securesend-prf-salt").await.unwrap();
    Identity::derive(&master, auth.public_key()).unwrap()
}

/// Two identities and their halves of a fresh pairing, each signed only by
/// its owner.
async fn pairing() -> (Identity, Identity, PairingKey, PairingKey) {
    let alice = identity().await;
    let bob = identity().await;
    let (sa, sb) = (PairingSession::start(&alice), PairingSession::start(&bob));
    let (oa, ob) = (sa.offer().clone(), sb.offer().clone());
    let ka = sa.complete(&alice, &ob).unwrap();
    let kb = sb.complete(&bob, &oa).unwrap();
    (alice, bob, ka, kb)
}

#[tokio::test]
async fn half_signed_pairing_key_is_refused() {
    let (_, _, ka, _) = pairing().await;
    let net = LoopbackNetwork::new();
    let (mut tx, _rx) = manual_pair(&net);
    let session = Session::new(config());
    let secret = TransferSecret::PairingKey(ka);
    assert!(matches!(
        session.send(&mut tx, &secret, Outgoing::Text("x".into())).await,
        Err(SsError::SignatureInvalid(_))
    ));
    assert!(matches!(session.state(), TransferState::Error(_)));
}

#[tokio::test]
async fn pairing_key_replaces_pin() {
    let (alice, bob, mut ka, mut kb) = pairing().await;
    let sig_a = ka.signature_of(alice.public_id()).unwrap();
    let sig_b = kb.signature_of(bob.public_id()).unwrap();
    ka.set_signature(bob.public_id(), sig_b).unwrap();
    kb.set_signature(alice.public_id(), sig_a).unwrap();

    let net = LoopbackNetwork::new();
    let (mut tx, mut rx) = manual_pair(&net);
    let sender = Session::new(config());
    let receiver = Session::new(config());
    let (s_tx, s_rx) = (TransferSecret::PairingKey(ka), TransferSecret::PairingKey(kb));
    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(&mut tx, &s_tx, Outgoing::Text("paired".into())),
            receiver.receive(&mut rx, &s_rx),
        )
    })
    .await
    .unwrap();
    sent.unwrap();
    assert_eq!(received.unwrap().text().unwrap(), "paired");
}

#[tokio::test]
async fn second_call_while_running_is_busy() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::new();
    let (mut first, mut second) = relay_pair(&hub, &net, PIN).await;
    let session = Session::new(config());
    let (s_first, s_second) = (shared(PIN), shared(PIN));

    let (running, rejected) = tokio::join!(
        session.receive(&mut first, &s_first),
        async {
            let result = session.receive(&mut second, &s_second).await;
            session.cancel();
            result
        },
    );
    assert!(matches!(rejected, Err(SsError::Busy)));
    assert!(matches!(running, Err(SsError::Cancelled)));
    assert_eq!(session.state(), TransferState::Idle);
}

#[tokio::test]
async fn connect_stage_times_out() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::new();
    let (mut lonely, _) = relay_pair(&hub, &net, PIN).await;
    let session = Session::new(SessionConfig {
        connect_timeout: Duration::from_millis(200),
        ..config()
    });
    let secret = shared(PIN);
    let result = session.receive(&mut lonely, &secret).await;
    assert!(matches!(
        result,
        Err(SsError::TransportTimeout {
            stage: Stage::Connect
        })
    ));
    assert_eq!(
        session.state(),
        TransferState::Error("timed out during connection".into())
    );
}

#[tokio::test]
async fn cancellation_settles_idle_and_sticks() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::new();
    let (mut waiting, mut again) = relay_pair(&hub, &net, PIN).await;
    let session = Session::new(config());
    let token = session.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let secret = shared(PIN);
    let result = session.receive(&mut waiting, &secret).await;
    assert!(matches!(result, Err(SsError::Cancelled)));
    assert_eq!(session.state(), TransferState::Idle);
    assert!(session.is_cancelled());
    assert!(matches!(
        session.receive(&mut again, &secret).await,
        Err(SsError::Cancelled)
    ));
}

#[tokio::test]
async fn expired_pin_is_refused() {
    let net = LoopbackNetwork::new();
    let (mut tx, _rx) = manual_pair(&net);
    let pin = generate_pin(TransportMethod::Manual).with_ttl(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let session = Session::new(config());
    let secret = TransferSecret::Pin(pin);
    assert!(matches!(
        session.send(&mut tx, &secret, Outgoing::Text("late".into())).await,
        Err(SsError::Expired)
    ));
}

#[tokio::test]
async fn failure_after_a_completed_transfer_is_reported() {
    let net = LoopbackNetwork::new();
    let (mut tx, mut rx) = manual_pair(&net);
    let sender = Session::new(config());
    let receiver = Session::new(config());
    let (s_tx, s_rx) = (shared(PIN), shared(PIN));
    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(&mut tx, &s_tx, Outgoing::Text("first".into())),
            receiver.receive(&mut rx, &s_rx),
        )
    })
    .await
    .unwrap();
    sent.unwrap();
    received.unwrap();
    assert_eq!(sender.state(), TransferState::Complete);

    let pin = generate_pin(TransportMethod::Manual).with_ttl(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let stale = TransferSecret::Pin(pin);
    let (mut again, _peer) = manual_pair(&net);
    assert!(matches!(
        sender.send(&mut again, &stale, Outgoing::Text("second".into())).await,
        Err(SsError::Expired)
    ));
    assert_eq!(sender.state(), TransferState::Error("transfer expired".into()));
}

#[tokio::test]
async fn late_receiver_completes_through_fallback() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::blocked();
    let op = Operator::new(opendal::services::Memory::default())
        .unwrap()
        .finish();
    let blobs = Arc::new(OperatorBlobStore::new(op, "late"));
    let secret = SecretString::from(PIN);
    let mut tx = RelayTransport::connect(hub.client(), Box::new(net.peer()), &secret, relay_options())
        .await
        .unwrap()
        .with_blob_store(blobs.clone());

    // the receiver turns up after a whole connect timeout has passed
    let sender = Session::new(SessionConfig {
        connect_timeout: Duration::from_secs(1),
        ..config()
    });
    let receiver = Session::new(config());
    let (s_tx, s_rx) = (shared(PIN), shared(PIN));
    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            sender.send(&mut tx, &s_tx, Outgoing::Text("worth the wait".into())),
            async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                let mut rx =
                    RelayTransport::connect(hub.client(), Box::new(net.peer()), &secret, relay_options())
                        .await?
                        .with_blob_store(blobs.clone());
                receiver.receive(&mut rx, &s_rx).await
            },
        )
    })
    .await
    .unwrap();

    sent.unwrap();
    assert_eq!(received.unwrap().text().unwrap(), "worth the wait");
    assert_eq!(sender.state(), TransferState::Complete);
}

#[tokio::test]
async fn unanswered_offer_expires_with_the_pin() {
    let hub = MemoryRelayHub::new();
    let net = LoopbackNetwork::new();
    let (mut lonely, _) = relay_pair(&hub, &net, PIN).await;
    let session = Session::new(SessionConfig {
        pin_ttl: Duration::from_millis(300),
        ..config()
    });
    let secret = shared(PIN);
    let result = session
        .send(&mut lonely, &secret, Outgoing::Text("anyone?".into()))
        .await;
    assert!(matches!(result, Err(SsError::Expired)));
    assert_eq!(session.state(), TransferState::Error("transfer expired".into()));
}

/// A sender driven one message at a time, to shape what a receiver sees.
struct Scripted {
    tx: RelayTransport<MemoryRelay>,
    metadata: TransferMetadata,
    frames: Vec<Bytes>,
}

impl Scripted {
    fn plan(tx: RelayTransport<MemoryRelay>, data: &[u8], chunk_size: usize) -> Self {
        let salt = generate_salt();
        let key = derive_key_with(&SecretString::from(PIN), &salt, &FAST_KDF);
        let sealer = ChunkSealer::new(&key);
        let frames = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(i, chunk)| Bytes::from(sealer.encrypt_chunk(i as u32, chunk).unwrap().to_frame()))
            .collect();
        let metadata = TransferMetadata {
            content_type: ContentType::Text,
            total_bytes: data.len() as u64,
            chunk_count: chunk_count(data.len() as u64, chunk_size),
            file_name: None,
            file_size: None,
            mime_type: None,
            created_at: now_millis(),
            salt,
        };
        Self { tx, metadata, frames }
    }

    async fn connect(&mut self) -> SsResult<()> {
        let ctx = OfferContext {
            salt: self.metadata.salt,
            preview: Some(self.metadata.clone()),
        };
        self.tx.offer(&ctx).await?;
        self.tx.await_answer().await?;
        self.tx.wait_connected().await?;
        Ok(())
    }

    async fn control(&mut self, message: ControlMessage) -> SsResult<()> {
        self.tx.send(ChannelMessage::Text(message.to_text()?)).await
    }

    async fn metadata(&mut self) -> SsResult<()> {
        let metadata = self.metadata.clone();
        self.control(ControlMessage::Metadata { metadata }).await
    }

    async fn chunk(&mut self, index: usize) -> SsResult<()> {
        let frame = self.frames[index].clone();
        self.tx.send(ChannelMessage::Binary(frame)).await
    }

    /// The next control message the receiver sends back.
    async fn reply(&mut self) -> SsResult<ControlMessage> {
        loop {
            match self.tx.recv().await? {
                Some(ChannelMessage::Text(text)) => return ControlMessage::from_text(&text),
                Some(ChannelMessage::Binary(_)) => continue,
                None => return Err(SsError::transport("receiver closed the channel")),
            }
        }
    }
}

async fn scripted(hub: &MemoryRelayHub, data: &[u8], chunk_size: usize) -> (Scripted, RelayTransport<MemoryRelay>) {
    let net = LoopbackNetwork::new();
    let (tx, rx) = relay_pair(hub, &net, PIN).await;
    (Scripted::plan(tx, data, chunk_size), rx)
}

#[tokio::test]
async fn metadata_stage_times_out() {
    let hub = MemoryRelayHub::new();
    let (mut script, mut rx) = scripted(&hub, b"hello", 1024).await;
    let receiver = Session::new(SessionConfig {
        metadata_timeout: Duration::from_millis(300),
        ..config()
    });
    let secret = shared(PIN);

    let (connected, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(script.connect(), receiver.receive(&mut rx, &secret))
    })
    .await
    .unwrap();

    connected.unwrap();
    assert!(matches!(
        received,
        Err(SsError::TransportTimeout {
            stage: Stage::Metadata
        })
    ));
    assert_eq!(
        receiver.state(),
        TransferState::Error("timed out during metadata".into())
    );
}

#[tokio::test]
async fn transfer_stage_times_out_after_a_partial_payload() {
    let hub = MemoryRelayHub::new();
    let (mut script, mut rx) = scripted(&hub, b"abcdefghij", 4).await;
    let receiver = Session::new(SessionConfig {
        transfer_timeout: Duration::from_millis(300),
        ..config()
    });
    let secret = shared(PIN);

    let (sent, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            async {
                script.connect().await?;
                script.metadata().await?;
                script.chunk(0).await
            },
            receiver.receive(&mut rx, &secret),
        )
    })
    .await
    .unwrap();

    sent.unwrap();
    assert!(matches!(
        received,
        Err(SsError::TransportTimeout {
            stage: Stage::Transfer
        })
    ));
    assert_eq!(
        receiver.state(),
        TransferState::Error("timed out during transfer".into())
    );
}

#[tokio::test]
async fn chunks_land_by_index_whatever_the_order() {
    let hub = MemoryRelayHub::new();
    let (mut script, mut rx) = scripted(&hub, b"abcdefghij", 4).await;
    let receiver = Session::new(config());
    let secret = shared(PIN);

    let (reply, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            async {
                script.connect().await?;
                // one chunk overtakes the metadata
                script.chunk(2).await?;
                script.metadata().await?;
                for index in [0, 0, 1, 2] {
                    script.chunk(index).await?;
                }
                script.control(ControlMessage::Done).await?;
                script.reply().await
            },
            receiver.receive(&mut rx, &secret),
        )
    })
    .await
    .unwrap();

    let received = received.unwrap();
    assert_eq!(received.text().unwrap(), "abcdefghij");
    assert_eq!(received.metadata.chunk_count, 3);
    assert_eq!(reply.unwrap(), ControlMessage::DoneAck);
    assert_eq!(receiver.state(), TransferState::Complete);
}

#[tokio::test]
async fn cancel_mid_transfer_notifies_the_sender() {
    let hub = MemoryRelayHub::new();
    let (mut script, mut rx) = scripted(&hub, b"abcdefghij", 4).await;
    let receiver = Session::new(config());
    let mut states = receiver.subscribe();
    let secret = shared(PIN);

    let (reply, received, _) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            async {
                script.connect().await?;
                script.metadata().await?;
                script.chunk(0).await?;
                script.reply().await
            },
            receiver.receive(&mut rx, &secret),
            async {
                states
                    .wait_for(|s| matches!(s, TransferState::Receiving { received: 1, .. }))
                    .await
                    .unwrap();
                receiver.cancel();
            },
        )
    })
    .await
    .unwrap();

    assert!(matches!(received, Err(SsError::Cancelled)));
    assert_eq!(reply.unwrap(), ControlMessage::Cancel);
    assert_eq!(receiver.state(), TransferState::Idle);
}

#[tokio::test]
async fn chunks_before_metadata_are_bounded_by_the_preview() {
    let hub = MemoryRelayHub::new();
    let (mut script, mut rx) = scripted(&hub, b"hello", 1024).await;
    let receiver = Session::new(config());
    let secret = shared(PIN);

    let (reply, received) = tokio::time::timeout(LIMIT, async {
        tokio::join!(
            async {
                script.connect().await?;
                script
                    .tx
                    .send(ChannelMessage::Binary(Bytes::from(vec![0u8; 1024])))
                    .await?;
                script.reply().await
            },
            receiver.receive(&mut rx, &secret),
        )
    })
    .await
    .unwrap();

    assert!(matches!(received, Err(SsError::SizeLimitExceeded { limit: 5, .. })));
    assert!(matches!(reply.unwrap(), ControlMessage::Abort { .. }));
}
