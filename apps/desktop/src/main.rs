use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ConnectionManager, LocalIdentity, ReadTarget, RestClient, SyncClient,
    SyncEvent, WebSocketTransport,
};
use shared::domain::{ConversationId, DeliveryState, LocalId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Terminal chat client: opens one conversation, prints it live and sends
/// each stdin line as a message.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "APP__TOKEN")]
    token: String,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "Me")]
    display_name: String,
    /// Conversation to open; defaults to the most recently active one.
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    api_url: Option<Url>,
    #[arg(long)]
    transport_url: Option<Url>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings().context("failed to load client settings")?;
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(transport_url) = args.transport_url {
        settings.transport_url = transport_url;
    }

    let api = Arc::new(RestClient::new(settings.api_url.clone(), args.token.clone())?);
    let (connection, transport_events) = ConnectionManager::new(
        settings.transport_url.clone(),
        Arc::new(WebSocketTransport),
        settings.backoff(),
    );
    let client = SyncClient::start(
        LocalIdentity {
            user_id: UserId::new(args.user_id),
            display_name: args.display_name,
        },
        settings.sync_timeouts(),
        api,
        connection,
        transport_events,
    );
    client.connect(args.token).await;

    let conversations = match client.refresh_conversations().await {
        Ok(conversations) => conversations,
        Err(err) => {
            warn!(error = %err, "desktop: could not load conversation list");
            Vec::new()
        }
    };
    for conversation in &conversations {
        println!(
            "[{}] {}",
            conversation.id,
            conversation.last_message_preview.as_deref().unwrap_or("")
        );
    }

    let conversation_id = match args.conversation {
        Some(id) => ConversationId::new(id),
        None => conversations
            .first()
            .map(|conversation| conversation.id.clone())
            .context("no conversations available; pass --conversation")?,
    };
    client.open(conversation_id.clone()).await?;
    println!("opened {conversation_id}; type to send, /retry <id>, /discard <id>, /read, /quit");

    let printer = tokio::spawn(print_events(client.clone(), conversation_id.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let result = match line.split_once(' ') {
            _ if line == "/quit" => break,
            _ if line == "/read" => client.mark_read(ReadTarget::Conversation(conversation_id.clone())).await,
            Some(("/retry", local_id)) => client.retry(LocalId::from(local_id.trim())).await,
            Some(("/discard", local_id)) => client.discard(LocalId::from(local_id.trim())).await,
            _ if line.is_empty() => continue,
            _ => client.send(conversation_id.clone(), line).await.map(|_| ()),
        };
        if let Err(err) = result {
            eprintln!("! {err}");
        }
    }

    client.close(conversation_id).await?;
    client.dispose().await;
    printer.abort();
    Ok(())
}

async fn print_events(client: SyncClient, conversation_id: ConversationId) {
    let mut events = client.subscribe_events();
    let mut printed = 0usize;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "desktop: event printer lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match event {
            SyncEvent::MessagesChanged {
                conversation_id: changed,
            } if changed == conversation_id => {
                let Ok(messages) = client.messages(conversation_id.clone()).await else {
                    return;
                };
                for message in messages.iter().skip(printed) {
                    let marker = match message.delivery {
                        DeliveryState::Pending => " (sending)",
                        DeliveryState::Failed => " (failed)",
                        DeliveryState::Confirmed => "",
                    };
                    println!(
                        "{} {}: {}{marker}",
                        message.created_at.format("%H:%M"),
                        message.sender_name,
                        message.content
                    );
                }
                printed = messages.len();
            }
            SyncEvent::DeliveryFailed { local_id, .. } => {
                println!("! message {local_id} failed; /retry {local_id} or /discard {local_id}");
            }
            SyncEvent::UnreadChanged { total } if total > 0 => {
                println!("* {total} unread elsewhere");
            }
            SyncEvent::JoinFailed { reason, .. } => println!("! could not join: {reason}"),
            SyncEvent::PhaseChanged { phase, .. } => println!("- {phase:?}"),
            SyncEvent::ConnectionChanged { connected, .. } => {
                println!("- {}", if connected { "online" } else { "offline" });
            }
            _ => {}
        }
    }
}
