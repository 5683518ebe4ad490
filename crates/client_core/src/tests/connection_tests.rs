use super::*;
use std::{collections::VecDeque, sync::Mutex as StdMutex};

use futures::channel::mpsc as frames;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;

/// Server side of one scripted link.
struct Peer {
    from_client: frames::UnboundedReceiver<String>,
    to_client: frames::UnboundedSender<Result<String, TransportError>>,
}

struct ScriptedTransport {
    links: StdMutex<VecDeque<TransportLink>>,
    tokens: StdMutex<Vec<String>>,
}

impl ScriptedTransport {
    fn with_links(count: usize) -> (Self, Vec<Peer>) {
        let mut links = VecDeque::new();
        let mut peers = Vec::new();
        for _ in 0..count {
            let (client_tx, from_client) = frames::unbounded::<String>();
            let (to_client, client_rx) = frames::unbounded();
            links.push_back(TransportLink {
                sink: Box::pin(client_tx.sink_map_err(|_| TransportError::Closed)),
                stream: Box::pin(client_rx),
            });
            peers.push(Peer {
                from_client,
                to_client,
            });
        }
        let transport = Self {
            links: StdMutex::new(links),
            tokens: StdMutex::new(Vec::new()),
        };
        (transport, peers)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        _endpoint: &Url,
        session_token: &str,
    ) -> Result<TransportLink, TransportError> {
        self.tokens
            .lock()
            .expect("tokens lock")
            .push(session_token.to_string());
        self.links
            .lock()
            .expect("links lock")
            .pop_front()
            .ok_or_else(|| TransportError::Connect("connection refused".into()))
    }
}

fn endpoint() -> Url {
    Url::parse("ws://chat.test/ws").expect("endpoint")
}

fn join(conversation: &str) -> ClientRequest {
    ClientRequest::JoinRoom {
        conversation_id: ConversationId::from(conversation),
    }
}

#[test]
fn backoff_ceiling_doubles_up_to_the_cap() {
    let backoff = Backoff::default();

    assert_eq!(backoff.ceiling(0), Duration::from_secs(1));
    assert_eq!(backoff.ceiling(1), Duration::from_secs(2));
    assert_eq!(backoff.ceiling(4), Duration::from_secs(16));
    assert_eq!(backoff.ceiling(5), Duration::from_secs(30));
    assert_eq!(backoff.ceiling(64), Duration::from_secs(30));
}

#[test]
fn backoff_delay_stays_within_the_ceiling() {
    let backoff = Backoff {
        base: Duration::from_millis(100),
        cap: Duration::from_secs(2),
    };
    let mut rng = StdRng::seed_from_u64(7);

    for attempt in 0..12 {
        let delay = backoff.delay(attempt, &mut rng);
        assert!(delay <= backoff.ceiling(attempt), "attempt {attempt}: {delay:?}");
    }
}

#[test]
fn decode_frame_rejects_message_without_sender() {
    let frame = json!({
        "type": "messageReceived",
        "payload": {
            "message": {
                "id": "m-1",
                "conversationId": "c-1",
                "content": "hi",
                "createdAt": "2024-05-01T10:00:00Z"
            }
        }
    })
    .to_string();

    assert!(matches!(
        decode_frame(&frame),
        Err(ProtocolError::MissingSender { .. })
    ));
    assert!(matches!(
        decode_frame("{not json"),
        Err(ProtocolError::MalformedFrame(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn connected_link_carries_frames_both_ways() {
    let (transport, mut peers) = ScriptedTransport::with_links(1);
    let transport = Arc::new(transport);
    let (manager, mut events) =
        ConnectionManager::new(endpoint(), transport.clone(), Backoff::default());

    manager.connect("tok-1").await;
    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Connected { generation: 1 })
    );
    assert_eq!(manager.status().status, ConnectionStatus::Connected);
    assert_eq!(
        transport.tokens.lock().expect("tokens lock").as_slice(),
        ["tok-1".to_string()]
    );

    manager.send(1, join("c-1")).await.expect("send");
    let frame = peers[0].from_client.next().await.expect("frame");
    let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
    assert_eq!(value["type"], "joinRoom");

    peers[0]
        .to_client
        .unbounded_send(Ok("garbage".into()))
        .expect("push frame");
    peers[0]
        .to_client
        .unbounded_send(Ok(json!({
            "type": "roomJoined",
            "payload": {"conversationId": "c-1"}
        })
        .to_string()))
        .expect("push frame");

    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Inbound {
            generation: 1,
            event: InboundEvent::RoomJoined {
                conversation_id: ConversationId::from("c-1"),
            },
        })
    );
}

#[tokio::test(start_paused = true)]
async fn lost_link_reconnects_under_a_new_generation() {
    let (transport, mut peers) = ScriptedTransport::with_links(2);
    let (manager, mut events) =
        ConnectionManager::new(endpoint(), Arc::new(transport), Backoff::default());

    manager.connect("tok-1").await;
    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Connected { generation: 1 })
    );

    drop(peers.remove(0));

    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Disconnected {
            generation: 1,
            reason: Some(TransportError::Closed.to_string()),
        })
    );
    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Connected { generation: 2 })
    );

    assert_eq!(
        manager.send(1, join("c-1")).await,
        Err(ConnectionError::StaleGeneration {
            requested: 1,
            current: 2,
        })
    );
    manager.send(2, join("c-1")).await.expect("send");
    assert!(peers[0].from_client.next().await.is_some());
}

#[tokio::test]
async fn send_before_connect_is_rejected() {
    let (transport, _peers) = ScriptedTransport::with_links(0);
    let (manager, _events) =
        ConnectionManager::new(endpoint(), Arc::new(transport), Backoff::default());

    assert_eq!(
        manager.send(1, join("c-1")).await,
        Err(ConnectionError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn failed_connect_reports_degraded_status() {
    let (transport, _peers) = ScriptedTransport::with_links(0);
    let (manager, _events) =
        ConnectionManager::new(endpoint(), Arc::new(transport), Backoff::default());
    let mut status = manager.watch_status();

    manager.connect("tok-1").await;
    let snapshot = status
        .wait_for(|snapshot| snapshot.last_error.is_some())
        .await
        .expect("status")
        .clone();

    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert!(snapshot.is_degraded());

    manager.disconnect().await;
    assert_eq!(manager.status().status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_reports_the_live_generation() {
    let (transport, _peers) = ScriptedTransport::with_links(1);
    let (manager, mut events) =
        ConnectionManager::new(endpoint(), Arc::new(transport), Backoff::default());
    manager.connect("tok-1").await;
    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Connected { generation: 1 })
    );

    manager.disconnect().await;

    assert_eq!(
        events.recv().await,
        Some(TransportEvent::Disconnected {
            generation: 1,
            reason: None,
        })
    );
    assert_eq!(manager.status().status, ConnectionStatus::Disconnected);
    assert_eq!(
        manager.send(1, join("c-1")).await,
        Err(ConnectionError::NotConnected)
    );
}
