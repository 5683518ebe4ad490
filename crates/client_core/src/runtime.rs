//! Async shell around [`SyncController`].
//!
//! One driver task owns the controller and serializes every input to it:
//! view intents arrive as commands, transport events from the connection
//! manager, REST results as completions, and timer expiries from the
//! controller's next deadline. [`SyncClient`] is the cloneable handle the
//! view layer talks to.

use std::sync::Arc;

use chrono::Utc;
use shared::domain::{ConversationId, LocalId, Message};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionEvents, ConnectionManager, ConnectionSnapshot},
    error::SyncError,
    notifications::{ReadTarget, UnreadSnapshot},
    rest::ConversationApi,
    sync::{
        Conversation, ConversationPhase, LocalIdentity, SyncAction, SyncController, SyncEvent,
        SyncTimeouts,
    },
};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 1024;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Open {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    Send {
        conversation_id: ConversationId,
        content: String,
        reply: Reply<Result<LocalId, SyncError>>,
    },
    Retry {
        local_id: LocalId,
        reply: Reply<Result<(), SyncError>>,
    },
    Discard {
        local_id: LocalId,
        reply: Reply<Result<(), SyncError>>,
    },
    Close {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    MarkRead {
        target: ReadTarget,
        reply: Reply<()>,
    },
    ApplyConversations {
        summaries: Vec<shared::protocol::ConversationSummary>,
        reply: Reply<Vec<Conversation>>,
    },
    Messages {
        conversation_id: ConversationId,
        reply: Reply<Vec<Message>>,
    },
    Conversations {
        reply: Reply<Vec<Conversation>>,
    },
    Phase {
        conversation_id: ConversationId,
        reply: Reply<ConversationPhase>,
    },
    Unread {
        reply: Reply<UnreadSnapshot>,
    },
    Shutdown,
}

enum Completion {
    History {
        conversation_id: ConversationId,
        epoch: u64,
        result: Result<Vec<Message>, String>,
    },
    Post {
        local_id: LocalId,
        result: Result<Message, String>,
    },
}

#[derive(Clone)]
pub struct SyncClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
    connection: Arc<ConnectionManager>,
    api: Arc<dyn ConversationApi>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncClient {
    /// Spawns the driver task. The transport is not dialed until
    /// [`SyncClient::connect`] is called.
    pub fn start(
        identity: LocalIdentity,
        timeouts: SyncTimeouts,
        api: Arc<dyn ConversationApi>,
        connection: Arc<ConnectionManager>,
        transport_events: ConnectionEvents,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        info!(user_id = %identity.user_id, "sync: runtime starting");
        let driver = Driver {
            controller: SyncController::new(identity, timeouts),
            connection: Arc::clone(&connection),
            api: Arc::clone(&api),
            events: events.clone(),
            completions,
        };
        let handle = tokio::spawn(driver.run(command_rx, transport_events, completion_rx));

        Self {
            commands,
            events,
            connection,
            api,
            driver: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub async fn connect(&self, session_token: impl Into<String>) {
        self.connection.connect(session_token).await;
    }

    pub async fn open(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.request(|reply| Command::Open {
            conversation_id,
            reply,
        })
        .await
    }

    /// Queues a message and returns its local id. The message shows up as
    /// pending immediately; delivery is reported through [`SyncEvent`]s.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<LocalId, SyncError> {
        let content = content.into();
        self.request(|reply| Command::Send {
            conversation_id,
            content,
            reply,
        })
        .await?
    }

    pub async fn retry(&self, local_id: LocalId) -> Result<(), SyncError> {
        self.request(|reply| Command::Retry { local_id, reply })
            .await?
    }

    pub async fn discard(&self, local_id: LocalId) -> Result<(), SyncError> {
        self.request(|reply| Command::Discard { local_id, reply })
            .await?
    }

    pub async fn close(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.request(|reply| Command::Close {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn mark_read(&self, target: ReadTarget) -> Result<(), SyncError> {
        self.request(|reply| Command::MarkRead { target, reply })
            .await
    }

    /// Pulls the conversation list from the backend and merges it into the
    /// known conversations.
    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        let summaries = self
            .api
            .list_conversations()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        self.request(|reply| Command::ApplyConversations { summaries, reply })
            .await
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>, SyncError> {
        self.request(|reply| Command::Messages {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        self.request(|reply| Command::Conversations { reply }).await
    }

    pub async fn phase(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationPhase, SyncError> {
        self.request(|reply| Command::Phase {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn unread(&self) -> Result<UnreadSnapshot, SyncError> {
        self.request(|reply| Command::Unread { reply }).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.watch_status()
    }

    /// Stops the driver and tears down the transport. Later calls on any
    /// clone of this handle fail with [`SyncError::RuntimeStopped`].
    pub async fn dispose(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "sync: driver task ended abnormally");
            }
        }
        self.connection.disconnect().await;
        info!("sync: runtime disposed");
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::RuntimeStopped)?;
        response.await.map_err(|_| SyncError::RuntimeStopped)
    }
}

struct Driver {
    controller: SyncController,
    connection: Arc<ConnectionManager>,
    api: Arc<dyn ConversationApi>,
    events: broadcast::Sender<SyncEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport: ConnectionEvents,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut transport_open = true;
        loop {
            let deadline = self.controller.next_deadline();
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                event = transport.recv(), if transport_open => match event {
                    Some(event) => {
                        let actions = self.controller.handle_transport(event, Instant::now());
                        self.execute(actions).await;
                    }
                    None => {
                        debug!("sync: transport event stream ended");
                        transport_open = false;
                    }
                },
                Some(completion) = completions.recv() => {
                    let actions = match completion {
                        Completion::History { conversation_id, epoch, result } => {
                            self.controller.history_loaded(&conversation_id, epoch, result)
                        }
                        Completion::Post { local_id, result } => {
                            self.controller.post_completed(&local_id, result)
                        }
                    };
                    self.execute(actions).await;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let actions = self.controller.tick(Instant::now());
                    self.execute(actions).await;
                }
            }
        }
        info!("sync: driver stopped");
    }

    /// Returns false once the driver should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        let now = Instant::now();
        match command {
            Command::Open {
                conversation_id,
                reply,
            } => {
                let actions = self.controller.open(&conversation_id, now);
                self.execute(actions).await;
                let _ = reply.send(());
            }
            Command::Send {
                conversation_id,
                content,
                reply,
            } => {
                let result = self
                    .controller
                    .send(&conversation_id, &content, now, Utc::now());
                let result = match result {
                    Ok((local_id, actions)) => {
                        self.execute(actions).await;
                        Ok(local_id)
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::Retry { local_id, reply } => {
                let result = self.controller.retry(&local_id, now);
                let _ = reply.send(self.execute_result(result).await);
            }
            Command::Discard { local_id, reply } => {
                let result = self.controller.discard(&local_id);
                let _ = reply.send(self.execute_result(result).await);
            }
            Command::Close {
                conversation_id,
                reply,
            } => {
                let actions = self.controller.close(&conversation_id);
                self.execute(actions).await;
                let _ = reply.send(());
            }
            Command::MarkRead { target, reply } => {
                let actions = self.controller.mark_read(&target);
                self.execute(actions).await;
                let _ = reply.send(());
            }
            Command::ApplyConversations { summaries, reply } => {
                let actions = self.controller.apply_conversation_list(summaries);
                self.execute(actions).await;
                let _ = reply.send(self.controller.conversations());
            }
            Command::Messages {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.controller.messages(&conversation_id));
            }
            Command::Conversations { reply } => {
                let _ = reply.send(self.controller.conversations());
            }
            Command::Phase {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.controller.phase(&conversation_id));
            }
            Command::Unread { reply } => {
                let _ = reply.send(self.controller.unread());
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn execute_result(
        &mut self,
        result: Result<Vec<SyncAction>, SyncError>,
    ) -> Result<(), SyncError> {
        let actions = result?;
        self.execute(actions).await;
        Ok(())
    }

    async fn execute(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Transmit {
                    generation,
                    request,
                } => {
                    let conversation_id = request.conversation_id().clone();
                    if let Err(err) = self.connection.send(generation, request).await {
                        debug!(
                            conversation_id = %conversation_id,
                            generation,
                            error = %err,
                            "sync: request not transmitted"
                        );
                    }
                }
                SyncAction::FetchHistory {
                    conversation_id,
                    epoch,
                } => {
                    let api = Arc::clone(&self.api);
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        let result = api
                            .fetch_history(&conversation_id)
                            .await
                            .map_err(|err| err.to_string());
                        let _ = completions.send(Completion::History {
                            conversation_id,
                            epoch,
                            result,
                        });
                    });
                }
                SyncAction::PostMessage {
                    conversation_id,
                    local_id,
                    content,
                } => {
                    let api = Arc::clone(&self.api);
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        let result = api
                            .post_message(&conversation_id, &content, &local_id)
                            .await
                            .map_err(|err| err.to_string());
                        let _ = completions.send(Completion::Post { local_id, result });
                    });
                }
                SyncAction::Emit(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }
}
