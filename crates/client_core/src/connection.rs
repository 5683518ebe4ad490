//! The single real-time connection of a session.
//!
//! [`ConnectionManager`] owns the transport, reconnects with capped
//! exponential backoff and full jitter, and numbers every successful
//! connection with a monotonically increasing generation. Inbound frames are
//! decoded into [`InboundEvent`]s once, here, and fanned out on one
//! subscription channel tagged with the generation that received them.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use shared::{
    domain::{ConversationId, LocalId, Message},
    error::ProtocolError,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{ConnectionError, TransportError};

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 1024;
const OUTBOUND_BUFFER: usize = 256;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Both halves of an established text-frame transport.
pub struct TransportLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Url,
        session_token: &str,
    ) -> Result<TransportLink, TransportError>;
}

/// WebSocket transport; the session token travels as a `token` query
/// parameter.
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        endpoint: &Url,
        session_token: &str,
    ) -> Result<TransportLink, TransportError> {
        let mut url = endpoint.clone();
        url.query_pairs_mut().append_pair("token", session_token);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (writer, reader) = ws_stream.split();

        let sink = writer
            .sink_map_err(|err| TransportError::Send(err.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(frame))));
        let stream = reader.filter_map(|item| {
            future::ready(match item {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::Receive(err.to_string()))),
            })
        });

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Capped exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            cap: DEFAULT_RECONNECT_CAP,
        }
    }
}

impl Backoff {
    /// Upper bound of the delay before reconnect attempt `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub generation: u64,
    pub retry_attempt: u32,
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    /// Reconnecting after a failure; the UI renders this as degraded.
    pub fn is_degraded(&self) -> bool {
        self.status == ConnectionStatus::Connecting
            && (self.retry_attempt > 0 || self.last_error.is_some())
    }
}

/// Server event after normalization at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    RoomJoined {
        conversation_id: ConversationId,
    },
    MessageReceived {
        message: Message,
        local_id: Option<LocalId>,
    },
    JoinError {
        conversation_id: ConversationId,
        reason: String,
    },
}

impl TryFrom<ServerEvent> for InboundEvent {
    type Error = ProtocolError;

    fn try_from(event: ServerEvent) -> Result<Self, Self::Error> {
        Ok(match event {
            ServerEvent::RoomJoined { conversation_id } => Self::RoomJoined { conversation_id },
            ServerEvent::MessageReceived { message, local_id } => Self::MessageReceived {
                message: Message::try_from(message)?,
                local_id,
            },
            ServerEvent::JoinError {
                conversation_id,
                reason,
            } => Self::JoinError {
                conversation_id,
                reason,
            },
        })
    }
}

pub fn decode_frame(frame: &str) -> Result<InboundEvent, ProtocolError> {
    InboundEvent::try_from(ServerEvent::from_frame(frame)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        generation: u64,
    },
    Disconnected {
        generation: u64,
        reason: Option<String>,
    },
    Inbound {
        generation: u64,
        event: InboundEvent,
    },
}

/// The one subscription to a manager's events, handed out at construction.
pub struct ConnectionEvents {
    rx: mpsc::Receiver<TransportEvent>,
}

impl ConnectionEvents {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct LinkSlot {
    supervisor: Option<JoinHandle<()>>,
    outbound: Option<(u64, mpsc::Sender<ClientRequest>)>,
}

pub struct ConnectionManager {
    endpoint: Url,
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    status: watch::Sender<ConnectionSnapshot>,
    events: mpsc::Sender<TransportEvent>,
    link: Mutex<LinkSlot>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: Url,
        transport: Arc<dyn Transport>,
        backoff: Backoff,
    ) -> (Arc<Self>, ConnectionEvents) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let (status, _) = watch::channel(ConnectionSnapshot {
            status: ConnectionStatus::Disconnected,
            generation: 0,
            retry_attempt: 0,
            last_error: None,
        });
        let manager = Arc::new(Self {
            endpoint,
            transport,
            backoff,
            status,
            events,
            link: Mutex::new(LinkSlot::default()),
        });
        (manager, ConnectionEvents { rx })
    }

    /// Starts the connection supervisor. Calling it while a supervisor is
    /// running is a no-op.
    pub async fn connect(self: &Arc<Self>, session_token: impl Into<String>) {
        let mut slot = self.link.lock().await;
        if slot
            .supervisor
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!("transport: connect ignored, supervisor already running");
            return;
        }
        let manager = Arc::clone(self);
        let session_token = session_token.into();
        slot.supervisor = Some(tokio::spawn(async move {
            manager.supervise(session_token).await;
        }));
    }

    /// Tears the transport down. Room membership intent lives elsewhere and
    /// survives this.
    pub async fn disconnect(&self) {
        {
            let mut slot = self.link.lock().await;
            if let Some(handle) = slot.supervisor.take() {
                handle.abort();
            }
            slot.outbound = None;
        }
        let previous = self.status();
        self.status.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Disconnected;
            snapshot.retry_attempt = 0;
        });
        if previous.status == ConnectionStatus::Connected {
            let _ = self
                .events
                .send(TransportEvent::Disconnected {
                    generation: previous.generation,
                    reason: None,
                })
                .await;
        }
        info!(generation = previous.generation, "transport: disconnected");
    }

    /// Queues a request on the connection of `generation`.
    pub async fn send(&self, generation: u64, request: ClientRequest) -> Result<(), ConnectionError> {
        let slot = self.link.lock().await;
        let sender = match &slot.outbound {
            Some((current, sender)) if *current == generation => sender,
            Some((current, _)) => {
                return Err(ConnectionError::StaleGeneration {
                    requested: generation,
                    current: *current,
                })
            }
            None => return Err(ConnectionError::NotConnected),
        };
        sender
            .try_send(request)
            .map_err(|_| ConnectionError::NotConnected)
    }

    pub fn status(&self) -> ConnectionSnapshot {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.status.subscribe()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn supervise(&self, session_token: String) {
        let mut attempt: u32 = 0;
        loop {
            self.status.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Connecting;
                snapshot.retry_attempt = attempt;
            });

            match self.transport.connect(&self.endpoint, &session_token).await {
                Ok(link) => {
                    attempt = 0;
                    let generation = self.status.borrow().generation + 1;
                    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
                    self.link.lock().await.outbound = Some((generation, outbound_tx));
                    self.status.send_modify(|snapshot| {
                        snapshot.status = ConnectionStatus::Connected;
                        snapshot.generation = generation;
                        snapshot.retry_attempt = 0;
                        snapshot.last_error = None;
                    });
                    info!(generation, endpoint = %self.endpoint, "transport: connected");
                    if self
                        .events
                        .send(TransportEvent::Connected { generation })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let reason = self.pump(link, outbound_rx, generation).await;

                    {
                        let mut slot = self.link.lock().await;
                        if slot
                            .outbound
                            .as_ref()
                            .is_some_and(|(current, _)| *current == generation)
                        {
                            slot.outbound = None;
                        }
                    }
                    warn!(generation, reason = %reason, "transport: connection lost");
                    self.status.send_modify(|snapshot| {
                        snapshot.status = ConnectionStatus::Connecting;
                        snapshot.last_error = Some(reason.to_string());
                    });
                    if self
                        .events
                        .send(TransportEvent::Disconnected {
                            generation,
                            reason: Some(reason.to_string()),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "transport: connect failed");
                    self.status.send_modify(|snapshot| {
                        snapshot.last_error = Some(err.to_string());
                    });
                }
            }

            let delay = self.backoff.delay(attempt, &mut rand::thread_rng());
            attempt = attempt.saturating_add(1);
            self.status.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Connecting;
                snapshot.retry_attempt = attempt;
            });
            debug!(attempt, delay_ms = delay.as_millis() as u64, "transport: reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
    }

    /// Moves frames both ways until the link fails; returns why it ended.
    async fn pump(
        &self,
        link: TransportLink,
        mut outbound: mpsc::Receiver<ClientRequest>,
        generation: u64,
    ) -> TransportError {
        let TransportLink {
            mut sink,
            mut stream,
        } = link;
        loop {
            tokio::select! {
                request = outbound.recv() => {
                    let Some(request) = request else {
                        return TransportError::Closed;
                    };
                    let frame = match request.to_frame() {
                        Ok(frame) => frame,
                        Err(err) => {
                            error!(generation, error = %err, "transport: failed to encode request");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(frame).await {
                        return err;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => match decode_frame(&text) {
                        Ok(event) => {
                            if self
                                .events
                                .send(TransportEvent::Inbound { generation, event })
                                .await
                                .is_err()
                            {
                                return TransportError::Closed;
                            }
                        }
                        Err(err) => {
                            warn!(generation, error = %err, "transport: discarding malformed frame");
                        }
                    },
                    Some(Err(err)) => return err,
                    None => return TransportError::Closed,
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
