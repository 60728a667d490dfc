use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_settings, load_settings_from, ChatSession, ClientEvent, HttpChatBackend, LiveChannel,
    Message, OfflineLiveChannel, WsLiveChannel,
};
use shared::domain::{MessageId, ProjectId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal front end for one direct conversation.
#[derive(Parser, Debug)]
struct Args {
    /// Overrides the server url from the settings file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    peer_id: i64,
    #[arg(long)]
    project_id: Option<i64>,
    /// Skip the live channel and rely on polling.
    #[arg(long)]
    offline: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
        settings.validate()?;
    }

    let user_id = UserId(args.user_id);
    let backend = Arc::new(HttpChatBackend::new(settings.server_url.clone(), user_id));
    let channel: Arc<dyn LiveChannel> = if args.offline {
        Arc::new(OfflineLiveChannel::new())
    } else {
        Arc::new(WsLiveChannel::connect(&settings, user_id)?)
    };
    let session = ChatSession::new(user_id, settings, backend, channel);

    let renderer = tokio::spawn(render_events(Arc::clone(&session)));
    match session
        .open_conversation(UserId(args.peer_id), args.project_id.map(ProjectId))
        .await
    {
        Ok(_) => println!("Conversation with user {} open. /help lists commands.", args.peer_id),
        Err(err) => warn!("initial history load failed: {err:#}"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !run_command(&session, line).await {
            break;
        }
    }

    session.close_conversation().await;
    renderer.abort();
    Ok(())
}

/// Returns false when the user asked to quit.
async fn run_command(session: &Arc<ChatSession>, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/quit" => return false,
        "/help" => {
            println!("/refresh  /older  /seen  /edit <id> <text>  /delete <id>  /quit");
            println!("anything else is sent as a message");
        }
        "/refresh" => {
            if let Err(err) = session.refresh().await {
                println!("refresh failed: {err:#}");
            }
        }
        "/older" => match session.load_older().await {
            Ok(page) if page.is_empty() => println!("no older messages"),
            Ok(page) => println!("loaded {} older messages", page.len()),
            Err(err) => println!("loading older messages failed: {err:#}"),
        },
        "/seen" => {
            let marked = session.mark_seen().await;
            println!("marked {marked} messages as read");
        }
        "/edit" => {
            let Some((id, text)) = rest.split_once(' ') else {
                println!("usage: /edit <id> <text>");
                return true;
            };
            if let Err(err) = session.edit(&MessageId::from(id), text).await {
                println!("edit failed: {err}");
            }
        }
        "/delete" if !rest.is_empty() => {
            if let Err(err) = session.delete(&MessageId::from(rest.trim())).await {
                println!("delete failed: {err}");
            }
        }
        "/delete" => println!("usage: /delete <id>"),
        _ => {
            if let Err(err) = session.send(line).await {
                println!("send failed: {err}");
                if let Some(draft) = err.draft() {
                    println!("unsent: {draft}");
                }
            }
        }
    }
    true
}

async fn render_events(session: Arc<ChatSession>) {
    let mut events = session.subscribe_events();
    loop {
        match events.recv().await {
            Ok(ClientEvent::MessagesChanged { .. }) => {
                render_messages(session.self_id(), &session.messages().await);
            }
            Ok(ClientEvent::TypingChanged { user_id, typing }) => {
                if typing {
                    println!("  user {user_id} is typing...");
                }
            }
            Ok(ClientEvent::ConnectionChanged(state)) => {
                if state.is_connected() {
                    println!("  live updates restored");
                } else {
                    println!("  live updates lost, polling");
                }
            }
            Ok(ClientEvent::ProfileImageDiscovered { .. }) => {}
            Err(RecvError::Lagged(_)) => {
                render_messages(session.self_id(), &session.messages().await);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn render_messages(self_id: UserId, messages: &[Message]) {
    println!("----");
    for message in messages {
        let author = if message.sender_id == self_id {
            "me".to_string()
        } else {
            format!("user {}", message.sender_id)
        };
        let mut flags = String::new();
        if message.is_pending() {
            flags.push_str(" (sending)");
        }
        if message.updated_at > message.created_at {
            flags.push_str(" (edited)");
        }
        if message.sender_id == self_id && message.read_at.is_some() {
            flags.push_str(" (read)");
        }
        println!(
            "[{}] {} {}: {}{}",
            message.id,
            message.created_at.format("%H:%M"),
            author,
            message.body,
            flags
        );
    }
}
