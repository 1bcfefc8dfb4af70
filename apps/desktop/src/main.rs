use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatClient, ClientEvent, DurableOfflineMirror, OfflineMirror, SyncEvent,
};
use shared::domain::ConversationId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal chat client")]
struct Args {
    /// Overrides `server_url` from client.toml / the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long, env = "CHAT_PASSWORD")]
    password: String,
    /// Directory holding the offline mirror database.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
    /// Conversation to open after logging in.
    #[arg(long)]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(delay) = args.reconnect_delay_ms {
        settings.reconnect_delay_ms = delay;
    }
    if let Some(attempts) = args.max_reconnect_attempts {
        settings.max_reconnect_attempts = attempts;
    }
    if let Some(data_dir) = &args.data_dir {
        settings.mirror_database_url = DurableOfflineMirror::sqlite_url_for_data_dir(data_dir);
    }

    tracing::info!(server_url = %settings.server_url, mirror = %settings.mirror_database_url, "starting chat client");
    let mirror: Arc<dyn OfflineMirror> =
        DurableOfflineMirror::initialize(&settings.mirror_database_url).await?;
    let client = ChatClient::new(settings, mirror)?;

    let user = client
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;
    println!("Logged in as {} ({})", user.display_name, user.id);
    print_conversations(&client).await;

    if let Some(conversation) = args.conversation {
        client
            .open_conversation(&ConversationId::new(conversation))
            .await
            .context("could not open conversation")?;
    }

    let printer = tokio::spawn(print_events(client.clone()));
    let result = read_commands(&client).await;

    printer.abort();
    client.logout().await;
    result
}

/// `/list`, `/open <id>`, `/new <phone>`, `/quit`; anything else is sent to the
/// open conversation.
async fn read_commands(client: &ChatClient) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/list", _) => {
                print_conversations(client).await;
                Ok(())
            }
            ("/open", id) => client.open_conversation(&ConversationId::new(id.trim())).await,
            ("/new", phone) => client
                .start_conversation(phone.trim())
                .await
                .map(|id| println!("Started conversation {id}")),
            _ => match client.snapshot().await.open {
                Some(open) => client.send_message(&open, line).await,
                None => {
                    println!("No conversation open; use /open <id>");
                    Ok(())
                }
            },
        };
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_refresh_failure() => {
                println!("session expired: {err}; please log in again");
                break;
            }
            Err(err) => println!("error: {err}"),
        }
    }
    Ok(())
}

async fn print_conversations(client: &ChatClient) {
    let snapshot = client.snapshot().await;
    for conversation in &snapshot.conversations {
        let unread = if snapshot.is_unread(&conversation.id) { "*" } else { " " };
        let last = conversation
            .last_message
            .as_ref()
            .map(|message| message.body.as_str())
            .unwrap_or("");
        println!("{unread} {} {}  {last}", conversation.id, conversation.display_name);
    }
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    while let Some(event) = next_event(&mut events).await {
        match event {
            ClientEvent::Sync(SyncEvent::MessagesUpdated(conversation_id)) => {
                if let Some(message) = client.snapshot().await.messages.last() {
                    println!("[{conversation_id}] {}: {}", message.sender_id, message.body);
                }
            }
            ClientEvent::Sync(SyncEvent::UnreadChanged) => {
                let unread = client.snapshot().await.unread;
                if !unread.is_empty() {
                    let ids: Vec<_> = unread.iter().map(|id| id.as_str()).collect();
                    println!("unread: {}", ids.join(", "));
                }
            }
            ClientEvent::Sync(SyncEvent::NewConversation { conversation_id, from }) => {
                println!("{from} started conversation {conversation_id}");
            }
            ClientEvent::Sync(SyncEvent::Connection(state)) => println!("channel: {state:?}"),
            ClientEvent::Sync(SyncEvent::ConnectionError(error)) => println!("channel error: {error}"),
            ClientEvent::SessionExpired { reason } => {
                println!("session expired: {reason}; please log in again");
                break;
            }
            _ => {}
        }
    }
}

/// Next client event, skipping over any the printer fell behind on; `None`
/// once the client is gone.
async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> Option<ClientEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
